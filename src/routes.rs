use log::warn;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session as WsSession};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::AppError;
use crate::gpio::{EdgeEvent, PinBackend, PinManager};
use crate::session::{Session, SessionTable};

const MAX_READ_BYTES: usize = 4096;

pub struct AppState<B: PinBackend> {
    pub manager: Arc<PinManager<B>>,
    pub sessions: Arc<SessionTable<B>>,
}

impl<B: PinBackend> AppState<B> {
    pub fn new(manager: Arc<PinManager<B>>) -> Self {
        Self {
            manager,
            sessions: Arc::new(SessionTable::default()),
        }
    }
}

impl<B: PinBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            sessions: Arc::clone(&self.sessions),
        }
    }
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Deserialize, Default)]
struct ReadQuery {
    bytes: Option<usize>,
}

#[derive(Serialize)]
struct SessionOpened {
    session_id: u64,
    pin_id: u32,
    subscribed: bool,
}

#[derive(Serialize)]
struct WriteResult {
    consumed: usize,
}

/// Streams accepted notifications to a WebSocket client. When `session` is
/// present it stays open, and keeps its share of the pin's notification
/// line, until the client goes away.
async fn handle_event_websocket<B: PinBackend>(
    mut ws: WsSession,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<EdgeEvent>,
    pin_filter: Option<u32>,
    session: Option<Session<B>>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = ws.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = ws.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if pin_filter.is_none_or(|p| p == event.pin_id)
                            && let Ok(text) = serde_json::to_string(&event)
                            && ws.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let msg = AppError::ResourceExhausted(format!("event stream lagged by {n} messages"));
                        if ws.text(msg.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }

    if let Some(session) = session {
        session.close();
    }
}

impl<B: PinBackend + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/pins")
                    .route(web::get().to(list_pins::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/pins/events")
                    .route(web::get().to(events_ws_all::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/pin/{pin_id}")
                    .route(web::get().to(pin_snapshot::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/pin/{pin_id}/sessions")
                    .route(web::post().to(open_session::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/pin/{pin_id}/events")
                    .route(web::get().to(get_events::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/pin/{pin_id}/watch")
                    .route(web::get().to(watch_pin_ws::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/session/{session_id}")
                    .route(web::get().to(read_session::<B>))
                    .route(web::post().to(write_session::<B>))
                    .route(web::delete().to(close_session::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[
                                Method::GET,
                                Method::POST,
                                Method::DELETE,
                            ]))
                            .to(method_not_allowed),
                    ),
            )
    }
}

async fn list_pins<B: PinBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.list_pins()))
}

async fn pin_snapshot<B: PinBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_path_id::<u32>(&req, "pin_id")?;

    Ok(web::Json(state.manager.pin_snapshot(pin_id)?))
}

async fn open_session<B: PinBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_path_id::<u32>(&req, "pin_id")?;
    let session_id = state.sessions.open(&state.manager, pin_id)?;
    let subscribed = state.sessions.get(session_id)?.is_subscribed();

    Ok(HttpResponse::Created().json(SessionOpened {
        session_id,
        pin_id,
        subscribed,
    }))
}

async fn read_session<B: PinBackend + 'static>(
    req: HttpRequest,
    query: web::Query<ReadQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let session_id = parse_path_id::<u64>(&req, "session_id")?;
    let session = state.sessions.get(session_id)?;
    let wanted = query.bytes.unwrap_or(1).min(MAX_READ_BYTES);

    let mut buf = Vec::with_capacity(wanted);
    session.read(wanted, &mut buf)?;

    Ok(HttpResponse::Ok().content_type("text/plain").body(buf))
}

async fn write_session<B: PinBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let session_id = parse_path_id::<u64>(&req, "session_id")?;
    let session = state.sessions.get(session_id)?;
    let consumed = session.write(&body)?;

    Ok(web::Json(WriteResult { consumed }))
}

async fn close_session<B: PinBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let session_id = parse_path_id::<u64>(&req, "session_id")?;
    state.sessions.close(session_id)?;

    Ok(HttpResponse::NoContent().finish())
}

async fn get_events<B: PinBackend + 'static>(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_path_id::<u32>(&req, "pin_id")?;

    Ok(web::Json(state.manager.get_events(pin_id, query.limit)?))
}

async fn watch_pin_ws<B: PinBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let pin_id = parse_path_id::<u32>(&req, "pin_id")?;
    let session = state.manager.open(pin_id)?;
    let rx = state.manager.subscribe_events();
    let (response, ws, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::InvalidArgument(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(ws, client_stream, rx, Some(pin_id), Some(session)).await;
    });

    Ok(response)
}

async fn events_ws_all<B: PinBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let rx = state.manager.subscribe_events();
    let (response, ws, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::InvalidArgument(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket::<B>(ws, client_stream, rx, None, None).await;
    });

    Ok(response)
}

fn parse_path_id<T: std::str::FromStr>(req: &HttpRequest, name: &str) -> Result<T, AppError> {
    let raw = req
        .match_info()
        .get(name)
        .ok_or_else(|| AppError::InvalidArgument(format!("Missing {name}")))?;

    raw.parse::<T>()
        .map_err(|_| AppError::InvalidArgument(format!("Invalid {name}")))
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
