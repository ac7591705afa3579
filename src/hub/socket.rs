use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};

use super::Hub;

pub async fn serve_socket(socket: WebSocket, hub: Hub) {
    let (sink, stream) = socket.split();
    pump(hub, sink, stream).await;
}

/// Run both halves of one live connection until either side ends.
///
/// The write half drains the subscriber buffer into text frames and stops on
/// a write error or when the hub closes the buffer. The read half only
/// watches for the client going away and then unregisters.
pub async fn pump<S, R, E>(hub: Hub, mut sink: S, mut stream: R)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let Some((id, mut outbound)) = hub.register().await else {
        let _ = sink.close().await;
        return;
    };

    let write_pump = async {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    };

    let read_pump = async {
        while let Some(Ok(message)) = stream.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    };

    tokio::select! {
        _ = write_pump => log::debug!("live client {id}: outbound closed after {}ms", id.age_ms()),
        _ = read_pump => log::debug!("live client {id}: went away after {}ms", id.age_ms()),
    }

    hub.unregister(id).await;
}
