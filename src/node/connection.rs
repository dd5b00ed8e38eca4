//! WebSocket session loop of one node.
//!
//! The task owns the outbound receiver for the life of the node. Each
//! iteration connects (offering the previous session id for resume), pumps
//! frames both ways until the socket drops, then backs off and retries.

use futures::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header, HeaderValue, StatusCode},
        protocol::Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};

use super::dispatcher::Dispatcher;
use super::{Node, NodeState, Outbound};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Exponential delay `base * 2^attempt`, capped at `max`.
pub(crate) fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

enum SessionEnd {
    Cancelled,
    Dropped(String),
}

/// Runs until the node is shut down, fails authorization or exhausts its
/// retry budget.
pub(crate) async fn run(node: Arc<Node>, dispatcher: Dispatcher) {
    let Some(mut outbound) = node.take_receiver() else {
        warn!(node = %node.name(), "la tarea de conexión ya está en marcha");
        return;
    };
    let cancel = node.cancel_token().clone();
    let options = node.options().clone();

    let mut attempt: u32 = 0;
    let mut first = true;
    let mut disconnected_at: Option<Instant> = None;

    while !cancel.is_cancelled() {
        if let Some(since) = disconnected_at {
            if since.elapsed() > options.resume_window && node.expire_session() {
                dispatcher.session_expired(&node);
            }
        }

        node.set_state(if first {
            NodeState::Connecting
        } else {
            NodeState::Reconnecting
        });
        first = false;

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect(&node) => result,
        };

        match connected {
            Ok(stream) => {
                info!(node = %node.name(), url = %node.config().websocket_url(), "🔌 WebSocket conectado");
                attempt = 0;

                match session(&node, &dispatcher, stream, &mut outbound).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Dropped(reason) => {
                        warn!(node = %node.name(), %reason, "sesión WebSocket terminada");
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
                node.set_state(NodeState::Disconnected);
                disconnected_at = Some(Instant::now());
            }
            // shutdown already marked the node failed
            Err(_) if cancel.is_cancelled() => break,
            Err(Error::Authorization(_)) => {
                error!(node = %node.name(), "❌ El nodo rechazó la contraseña, abandonando");
                node.set_state(NodeState::Failed);
                dispatcher.node_failed(&node);
                return;
            }
            Err(e) => {
                attempt += 1;
                warn!(node = %node.name(), attempt, error = %e, "fallo al conectar");
                if options.max_retries.is_some_and(|max| attempt > max) {
                    error!(node = %node.name(), attempt, "🚨 Reintentos agotados, nodo marcado como fallido");
                    node.set_state(NodeState::Failed);
                    dispatcher.node_failed(&node);
                    return;
                }
                node.set_state(NodeState::Disconnected);
                disconnected_at.get_or_insert_with(Instant::now);
            }
        }

        let delay = backoff(attempt, options.backoff_base, options.backoff_max);
        debug!(node = %node.name(), delay = %humantime::format_duration(delay), "esperando antes de reconectar");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(node = %node.name(), "tarea de conexión detenida");
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::InvalidData(format!("invalid header value: {e}")))
}

async fn connect(node: &Node) -> Result<WsStream> {
    let url = node.config().websocket_url();
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::InvalidData(format!("invalid node url {url}: {e}")))?;

    let headers = request.headers_mut();
    headers.insert(header::AUTHORIZATION, header_value(&node.config().password)?);
    headers.insert("user-id", header_value(&node.identity().user_id.get().to_string())?);
    headers.insert("client-name", header_value(&node.identity().client_name)?);
    if let Some(session_id) = node.session_id() {
        debug!(node = %node.name(), %session_id, "ofreciendo sesión para reanudar");
        headers.insert("session-id", header_value(&session_id)?);
    }

    let limit = node.options().connect_timeout;
    let Ok(handshake) = tokio::time::timeout(limit, connect_async(request)).await else {
        return Err(Error::Timeout(format!(
            "websocket handshake with {} after {}",
            node.name(),
            humantime::format_duration(limit)
        )));
    };

    match handshake {
        Ok((stream, response)) => {
            trace!(status = ?response.status(), "handshake WebSocket completado");
            Ok(stream)
        }
        Err(tungstenite::Error::Http(response))
            if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
        {
            Err(Error::Authorization(node.name().to_string()))
        }
        Err(e) => Err(Error::WebSocket(Box::new(e))),
    }
}

/// Asks the node to keep the session resumable for the configured window.
fn enable_resume(node: &Node, session_id: String) {
    let rest = node.rest();
    let timeout = node.options().resume_window;
    let name = node.name().to_string();
    tokio::spawn(async move {
        if let Err(e) = rest.update_session(&session_id, true, timeout).await {
            warn!(node = %name, error = %e, "no se pudo activar la reanudación de sesión");
        }
    });
}

async fn session(
    node: &Arc<Node>,
    dispatcher: &Dispatcher,
    stream: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> SessionEnd {
    let (mut sink, mut stream) = stream.split();
    let cancel = node.cancel_token().clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    debug!(node = %node.name(), error = %e, "frame de cierre no enviado");
                }
                return SessionEnd::Cancelled;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(session_id) = dispatcher.dispatch(node, &text).await {
                        enable_resume(node, session_id);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("closed by node ({}: {})", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "closed by node".to_string());
                    return SessionEnd::Dropped(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                None => return SessionEnd::Dropped("stream ended".to_string()),
            },
            queued = outbound.recv(), if node.is_connected() => match queued {
                Some(queued) if node.is_current(&queued) => {
                    match serde_json::to_string(&queued.command) {
                        Ok(text) => {
                            trace!(node = %node.name(), op = queued.command.op(), "enviando comando");
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                return SessionEnd::Dropped(e.to_string());
                            }
                        }
                        Err(e) => warn!(node = %node.name(), error = %e, "no se pudo serializar el comando"),
                    }
                }
                Some(queued) => {
                    trace!(node = %node.name(), op = queued.command.op(), "descartando comando de una sesión perdida");
                }
                None => return SessionEnd::Cancelled,
            },
        }
    }
}
