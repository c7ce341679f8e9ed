mod reconnect;

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use envelope::{Inbound, Outbound, decode_outbound, encode_inbound};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::reconnect::ReconnectController;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

const AUTH_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing API token; pass --token or set TASKWIRE_TOKEN")]
    MissingToken,
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket closed")]
    WsClosed,
    #[error("envelope decode failed: {0}")]
    Decode(#[from] envelope::CodecError),
    #[error("timed out waiting for websocket envelope")]
    Timeout,
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("server returned error for {endpoint}: {message}")]
    ServerError { endpoint: String, message: String },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "taskwire-cli", about = "Taskwire API and websocket CLI")]
struct Cli {
    #[arg(long, env = "TASKWIRE_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "TASKWIRE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone)]
struct CliContext {
    base_url: String,
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping,
    Listen(ListenArgs),
    Send(SendArgs),
    Typing(TypingArgs),
    Notifications(NotificationsCommand),
    History(HistoryArgs),
}

#[derive(Args, Debug)]
struct ListenArgs {
    /// Channel to subscribe to; repeat the flag for several.
    #[arg(long = "channel")]
    channels: Vec<Uuid>,
}

#[derive(Args, Debug)]
struct SendArgs {
    channel_id: Uuid,
    content: String,

    #[arg(long)]
    reply_to: Option<Uuid>,
}

#[derive(Args, Debug)]
struct TypingArgs {
    channel_id: Uuid,

    /// Announce that typing stopped instead of started.
    #[arg(long, default_value_t = false)]
    stop: bool,
}

#[derive(Args, Debug)]
struct NotificationsCommand {
    #[command(subcommand)]
    command: NotificationsSubcommand,
}

#[derive(Subcommand, Debug)]
enum NotificationsSubcommand {
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },
    MarkRead {
        id: Uuid,
    },
    MarkAllRead,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    channel_id: Uuid,

    #[arg(long)]
    limit: Option<i64>,

    /// Millisecond epoch cursor; only older messages are returned.
    #[arg(long)]
    before: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let ctx = CliContext { base_url: cli.base_url, token: cli.token };

    match cli.command {
        Command::Ping => run_ping(&ctx).await,
        Command::Listen(args) => run_listen(&ctx, &args).await,
        Command::Send(args) => run_send(&ctx, &args).await,
        Command::Typing(args) => run_typing(&ctx, &args).await,
        Command::Notifications(notifications) => run_notifications(&ctx, notifications).await,
        Command::History(args) => run_history(&ctx, &args).await,
    }
}

// =============================================================================
// REST COMMANDS
// =============================================================================

async fn run_ping(ctx: &CliContext) -> Result<(), CliError> {
    let client = reqwest::Client::new();
    let url = format!("{}/healthz", ctx.base_url.trim_end_matches('/'));
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerError {
            endpoint: format!("HTTP {}", status.as_u16()),
            message: "health check failed".to_owned(),
        });
    }
    println!("ok");
    Ok(())
}

async fn run_notifications(
    ctx: &CliContext,
    notifications: NotificationsCommand,
) -> Result<(), CliError> {
    match notifications.command {
        NotificationsSubcommand::List { status, limit } => {
            let mut path = String::from("/api/notifications");
            let mut query = Vec::new();
            if let Some(status) = status {
                query.push(format!("status={status}"));
            }
            if let Some(limit) = limit {
                query.push(format!("limit={limit}"));
            }
            if !query.is_empty() {
                path = format!("{path}?{}", query.join("&"));
            }
            let json = api_request(ctx, reqwest::Method::GET, &path, None).await?;
            print_json(&json)
        }
        NotificationsSubcommand::MarkRead { id } => {
            let path = format!("/api/notifications/{id}");
            let body = serde_json::json!({ "status": "read" });
            let json = api_request(ctx, reqwest::Method::PATCH, &path, Some(body)).await?;
            print_json(&json)
        }
        NotificationsSubcommand::MarkAllRead => {
            let json = api_request(
                ctx,
                reqwest::Method::POST,
                "/api/notifications/mark-all-read",
                Some(Value::Object(serde_json::Map::new())),
            )
            .await?;
            print_json(&json)
        }
    }
}

async fn run_history(ctx: &CliContext, args: &HistoryArgs) -> Result<(), CliError> {
    let mut path = format!("/api/channels/{}/messages", args.channel_id);
    let mut query = Vec::new();
    if let Some(limit) = args.limit {
        query.push(format!("limit={limit}"));
    }
    if let Some(before) = args.before {
        query.push(format!("before={before}"));
    }
    if !query.is_empty() {
        path = format!("{path}?{}", query.join("&"));
    }
    let json = api_request(ctx, reqwest::Method::GET, &path, None).await?;
    print_json(&json)
}

async fn api_request(
    ctx: &CliContext,
    method: reqwest::Method,
    path: &str,
    body: Option<Value>,
) -> Result<Value, CliError> {
    let token = ctx.token.as_deref().ok_or(CliError::MissingToken)?;

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);

    let client = reqwest::Client::builder().default_headers(headers).build()?;
    let url = format!("{}{}", ctx.base_url.trim_end_matches('/'), path);

    let request = client.request(method, &url);
    let request = if let Some(json) = body {
        request.json(&json)
    } else {
        request
    };

    let response = request.send().await?;
    let status = response.status();
    let value = response.json::<Value>().await.unwrap_or_else(|_| Value::Null);

    if !status.is_success() {
        return Err(CliError::ServerError {
            endpoint: format!("HTTP {}", status.as_u16()),
            message: value.to_string(),
        });
    }

    Ok(value)
}

// =============================================================================
// WEBSOCKET COMMANDS
// =============================================================================

async fn run_listen(ctx: &CliContext, args: &ListenArgs) -> Result<(), CliError> {
    let mut controller = ReconnectController::new();

    loop {
        controller.on_connecting();
        match connect_and_auth(ctx, &args.channels, &mut controller).await {
            Ok((mut stream, _user_id)) => {
                eprintln!("connected; streaming envelopes");
                if let Err(error) = pump_envelopes(&mut stream).await {
                    eprintln!("connection lost: {error}");
                }
            }
            Err(CliError::AuthRejected(message)) => {
                // Fresh retries with the same credentials cannot succeed.
                controller.close();
                return Err(CliError::AuthRejected(message));
            }
            Err(error) => eprintln!("connect failed: {error}"),
        }

        let Some(delay) = controller.on_connection_lost() else {
            return Ok(());
        };
        eprintln!("reconnecting in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}

async fn run_send(ctx: &CliContext, args: &SendArgs) -> Result<(), CliError> {
    let mut controller = ReconnectController::new();
    let (mut stream, user_id) = connect_and_auth(ctx, &[args.channel_id], &mut controller).await?;

    let envelope = Inbound::ChatMessage {
        channel_id: args.channel_id,
        content: args.content.clone(),
        reply_to: args.reply_to,
    };
    send_inbound(&mut stream, &envelope).await?;

    // The author receives their own copy through the broadcast; that copy
    // carries the persisted id and timestamp. Match on author as well as
    // content so a peer's identical message is not mistaken for the ack.
    let deadline = tokio::time::Instant::now() + SEND_ACK_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match recv_outbound(&mut stream, remaining).await? {
            Outbound::Message(message) if is_own_broadcast(&message, user_id, &args.content) => {
                print_json(&serde_json::to_value(&message)?)?;
                break;
            }
            Outbound::Error { content } => {
                return Err(CliError::ServerError {
                    endpoint: "chat_message".to_owned(),
                    message: content,
                });
            }
            Outbound::Heartbeat {} => {
                send_inbound(&mut stream, &Inbound::HeartbeatResponse {}).await?;
            }
            _ => {}
        }
    }

    let _ = stream.close(None).await;
    Ok(())
}

/// The ack for a sent message is the author's own broadcast copy. A peer may
/// post identical content concurrently, so author and content must both match.
fn is_own_broadcast(message: &envelope::ChatMessage, user_id: Uuid, content: &str) -> bool {
    message.author_id == user_id && message.content == content
}

async fn run_typing(ctx: &CliContext, args: &TypingArgs) -> Result<(), CliError> {
    let mut controller = ReconnectController::new();
    let (mut stream, _user_id) = connect_and_auth(ctx, &[args.channel_id], &mut controller).await?;

    let envelope = Inbound::Typing { channel_id: args.channel_id, is_typing: !args.stop };
    send_inbound(&mut stream, &envelope).await?;

    let _ = stream.close(None).await;
    Ok(())
}

/// Connect, authenticate in-band, and hand back the live stream along with
/// the authenticated user id.
async fn connect_and_auth(
    ctx: &CliContext,
    channels: &[Uuid],
    controller: &mut ReconnectController,
) -> Result<(WsStream, Uuid), CliError> {
    let token = ctx.token.as_deref().ok_or(CliError::MissingToken)?;

    let url = ws_url(&ctx.base_url)?;
    let (mut stream, _) = connect_async(url)
        .await
        .map_err(|error| CliError::WsConnect(Box::new(error)))?;

    controller.on_authenticating();
    let auth = Inbound::Authenticate {
        token: token.to_owned(),
        channel_ids: channels.to_vec(),
    };
    send_inbound(&mut stream, &auth).await?;

    let deadline = tokio::time::Instant::now() + AUTH_REPLY_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match recv_outbound(&mut stream, remaining).await? {
            Outbound::AuthSuccess { user_id } => {
                eprintln!("authenticated as {user_id}");
                controller.on_connected();
                return Ok((stream, user_id));
            }
            Outbound::AuthError { message } => return Err(CliError::AuthRejected(message)),
            _ => {}
        }
    }
}

/// Print every incoming envelope, answering heartbeats as they arrive.
async fn pump_envelopes(stream: &mut WsStream) -> Result<(), CliError> {
    loop {
        match recv_outbound(stream, Duration::from_secs(90)).await? {
            Outbound::Heartbeat {} => {
                send_inbound(stream, &Inbound::HeartbeatResponse {}).await?;
            }
            envelope => print_json(&serde_json::to_value(&envelope)?)?,
        }
    }
}

async fn send_inbound(stream: &mut WsStream, envelope: &Inbound) -> Result<(), CliError> {
    stream
        .send(Message::Text(encode_inbound(envelope).into()))
        .await
        .map_err(|error| CliError::WsConnect(Box::new(error)))
}

async fn recv_outbound(stream: &mut WsStream, timeout: Duration) -> Result<Outbound, CliError> {
    let fut = async {
        loop {
            let Some(message) = stream.next().await else {
                return Err(CliError::WsClosed);
            };
            match message.map_err(|error| CliError::WsConnect(Box::new(error)))? {
                Message::Text(text) => return decode_outbound(&text).map_err(CliError::from),
                Message::Close(_) => return Err(CliError::WsClosed),
                _ => {}
            }
        }
    };

    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| CliError::Timeout)?
}

fn ws_url(base_url: &str) -> Result<String, CliError> {
    if let Some(rest) = base_url.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/api/ws"));
    }
    if let Some(rest) = base_url.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/api/ws"));
    }

    Err(CliError::InvalidBaseUrl(base_url.to_owned()))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
