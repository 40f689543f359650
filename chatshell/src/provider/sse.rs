use std::sync::Arc;

use futures::stream::StreamExt;
use reqwest::RequestBuilder;
use reqwest_eventsource::{Error as EventError, Event, EventSource};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, info_span, warn, Instrument};

use super::handle::DebugTransport;
use super::{StreamChunk, StreamResponse};
use crate::error::ClientError;

pub const STREAM_BUFFER: usize = 8;

/// What a vendor-specific parser wants done with one SSE event.
#[derive(Debug)]
pub enum SseAction {
    Emit(String),
    Skip,
    Done,
    Fail(ClientError),
}

/// Runs the event source on a worker task, forwarding parsed content in
/// order and always finishing with one terminal chunk. The worker exits as
/// soon as the receiving side is dropped.
pub(crate) fn spawn<P>(
    provider: String,
    request: RequestBuilder,
    debug: Option<Arc<dyn DebugTransport>>,
    mut parse: P,
) -> Result<StreamResponse, ClientError>
where
    P: FnMut(&str, &str) -> SseAction + Send + 'static,
{
    let mut es = EventSource::new(request).map_err(|e| ClientError::Stream(e.to_string()))?;
    let (tx, rx) = mpsc::channel::<StreamChunk>(STREAM_BUFFER);
    let meta = json!({ "provider": provider });
    let span = info_span!("sse_consumer", provider = %provider);

    task::spawn(
        async move {
            let terminal = loop {
                let event = tokio::select! {
                    _ = tx.closed() => {
                        info!("Consumer dropped stream");
                        es.close();
                        return;
                    }
                    event = es.next() => event,
                };

                match event {
                    None => break StreamChunk::done(),
                    Some(Ok(Event::Open)) => debug!("Connection open"),
                    Some(Ok(Event::Message(message))) => {
                        if let Some(debug) = &debug {
                            debug.response(&provider, 200, &message.data);
                        }

                        match parse(&message.event, &message.data) {
                            SseAction::Emit(text) if text.is_empty() => {}
                            SseAction::Emit(text) => {
                                if tx.send(StreamChunk::content(text)).await.is_err() {
                                    info!("Consumer dropped stream");
                                    es.close();
                                    return;
                                }
                            }
                            SseAction::Skip => {}
                            SseAction::Done => break StreamChunk::done(),
                            SseAction::Fail(err) => break StreamChunk::failed(err),
                        }
                    }
                    Some(Err(EventError::StreamEnded)) => break StreamChunk::done(),
                    Some(Err(EventError::InvalidStatusCode(status, resp))) => {
                        let body = resp.text().await.unwrap_or_default();
                        if let Some(debug) = &debug {
                            debug.response(&provider, status.as_u16(), &body);
                        }
                        warn!(status = status.as_u16(), "Stream rejected");
                        break StreamChunk::failed(ClientError::from_status(&provider, status.as_u16(), &body));
                    }
                    Some(Err(err)) => {
                        warn!("Stream error: {}", err);
                        break StreamChunk::failed(ClientError::Stream(err.to_string()));
                    }
                }
            };

            es.close();
            let _ = tx.send(terminal).await;
            info!("Finished streaming")
        }
        .instrument(span),
    );

    Ok(StreamResponse::new(meta, rx))
}
