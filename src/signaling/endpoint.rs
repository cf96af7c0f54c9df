use std::sync::Arc;

use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use futures::{channel::mpsc, SinkExt};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigErrorKind, Error, SignalingErrorKind},
    peer::MediaApi,
    registry::StreamRegistry,
};

/// Frames a signaling client may have queued for its WebSocket before its writes wait.
const SOCKET_BUFFER: usize = 16;

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct PortParams {
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedStream {
    pub port: u16,
}

/// Stream management and WebSocket signaling routes for [`actix_web`].
#[derive(Debug)]
pub struct RelayEndpoint<A: MediaApi> {
    registry: Arc<StreamRegistry<A>>,
}

impl<A: MediaApi> Clone for RelayEndpoint<A> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<A: MediaApi> RelayEndpoint<A> {
    pub fn new(registry: Arc<StreamRegistry<A>>) -> Self {
        Self { registry }
    }

    /// Configures the following routes:
    /// - `POST /stream` creates a stream, on the port given as `{"port":N}` or `?port=N` if any.
    /// - `GET /stream` lists the streams.
    /// - `DELETE /stream?port=N` deletes a stream.
    /// - `GET /websocket?port=N` opens a signaling session for a stream.
    ///
    /// ```rust,ignore
    /// let endpoint = RelayEndpoint::new(registry);
    /// HttpServer::new(move || {
    ///   App::new()
    ///     .configure(|cfg| endpoint.clone().configure(cfg))
    /// })
    /// .bind("127.0.0.1:8080")?
    /// .run()
    /// .await
    /// ```
    pub fn configure(self, cfg: &mut web::ServiceConfig) {
        let endpoint = web::Data::new(self);

        cfg.service(
            web::resource("/stream")
                .route(web::post().to(Self::create_route))
                .route(web::get().to(Self::list_route))
                .route(web::delete().to(Self::delete_route)),
        )
        .service(web::resource("/websocket").route(web::get().to(Self::websocket_route)))
        .app_data(endpoint);
    }

    /// POST /stream
    async fn create(&self, query: PortParams, body: web::Bytes) -> Result<HttpResponse, Error> {
        let port = match query.port {
            Some(port) => Some(port),
            None if body.is_empty() => None,
            None => serde_json::from_slice::<PortParams>(&body)
                .map_err(|e| Error::new_config(e.to_string(), ConfigErrorKind::InvalidPortError))?
                .port,
        };
        if port == Some(0) {
            return Err(Error::new_config(
                "port must not be 0".to_string(),
                ConfigErrorKind::InvalidPortError,
            ));
        }

        let port = self.registry.create(port).await?;
        Ok(HttpResponse::Created().json(CreatedStream { port }))
    }

    /// DELETE /stream?port=N
    async fn delete(&self, query: PortParams) -> Result<HttpResponse, Error> {
        let port = required_port(query)?;
        self.registry.delete(port).await?;
        Ok(HttpResponse::Ok().finish())
    }

    /// GET /websocket?port=N
    async fn websocket(
        &self,
        query: PortParams,
        req: HttpRequest,
        payload: web::Payload,
    ) -> Result<HttpResponse, actix_web::Error> {
        let port = required_port(query)?;
        let stream = self.registry.lookup(port).await?;
        let client = stream.open_session().await?;

        let (inbound_sender, inbound) = mpsc::unbounded();
        let (outbound, outgoing) = mpsc::channel::<String>(SOCKET_BUFFER);
        let outbound = outbound.sink_map_err(|e| {
            Error::new_signaling(e.to_string(), SignalingErrorKind::ConnectionClosedError)
        });

        let socket = SignalingSocket {
            port,
            inbound_sender,
            outgoing: Some(outgoing),
        };
        let response = match ws::start(socket, &req, payload) {
            Ok(response) => response,
            Err(err) => {
                client.teardown().await;
                return Err(err);
            }
        };

        tracing::info!("Signaling client {} joins stream {}", client.id, port);
        tokio::spawn(client.run(inbound, outbound));
        Ok(response)
    }
}

impl<A: MediaApi> RelayEndpoint<A> {
    async fn create_route(
        endpoint: web::Data<Self>,
        query: web::Query<PortParams>,
        body: web::Bytes,
    ) -> Result<HttpResponse, actix_web::Error> {
        endpoint
            .create(query.into_inner(), body)
            .await
            .map_err(|e| e.into())
    }

    async fn list_route(endpoint: web::Data<Self>) -> Result<HttpResponse, actix_web::Error> {
        Ok(HttpResponse::Ok().json(endpoint.registry.list_info().await))
    }

    async fn delete_route(
        endpoint: web::Data<Self>,
        query: web::Query<PortParams>,
    ) -> Result<HttpResponse, actix_web::Error> {
        endpoint
            .delete(query.into_inner())
            .await
            .map_err(|e| e.into())
    }

    async fn websocket_route(
        endpoint: web::Data<Self>,
        query: web::Query<PortParams>,
        req: HttpRequest,
        payload: web::Payload,
    ) -> Result<HttpResponse, actix_web::Error> {
        endpoint
            .websocket(query.into_inner(), req, payload)
            .await
    }
}

fn required_port(query: PortParams) -> Result<u16, Error> {
    query.port.ok_or_else(|| {
        Error::new_config(
            "port parameter is required".to_string(),
            ConfigErrorKind::InvalidPortError,
        )
    })
}

/// WebSocket actor of one signaling client. Text frames are handed to the client, and frames the
/// client writes are sent back until the client closes its side.
#[derive(Debug)]
struct SignalingSocket {
    port: u16,
    inbound_sender: mpsc::UnboundedSender<Result<String, Error>>,
    outgoing: Option<mpsc::Receiver<String>>,
}

impl Actor for SignalingSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::debug!("WebSocket connection for stream {} is started", self.port);
        if let Some(outgoing) = self.outgoing.take() {
            ctx.add_stream(outgoing);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::debug!("WebSocket connection for stream {} is stopped", self.port);
        self.inbound_sender.close_channel();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SignalingSocket {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Text(text)) => {
                if self.inbound_sender.unbounded_send(Ok(text.to_string())).is_err() {
                    ctx.stop();
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::debug!("ignoring binary frame on stream {}", self.port);
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => (),
            Err(err) => {
                let _ = self.inbound_sender.unbounded_send(Err(Error::new_signaling(
                    err.to_string(),
                    SignalingErrorKind::ConnectionClosedError,
                )));
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<String> for SignalingSocket {
    fn handle(&mut self, text: String, ctx: &mut Self::Context) {
        ctx.text(text);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.close(None);
        ctx.stop();
    }
}
