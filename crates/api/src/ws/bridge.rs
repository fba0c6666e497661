//! Relays a job's progress events to one WebSocket connection.

use std::sync::Arc;

use lectern_core::channels::ChannelName;
use lectern_core::types::JobId;
use lectern_worker::JobQueue;

use crate::ws::connection::{ClientHandle, Subscription};
use crate::ws::hub::Hub;
use crate::ws::messages::ServerMessage;

/// Forward every event of `job_id` to `client` until the subscription is
/// cancelled or the job reaches a terminal state.
///
/// Events are delivered with [`Hub::send_to`], so a client that stops
/// reading is evicted instead of stalling the job.
pub(crate) async fn run_job_bridge(
    queue: Arc<JobQueue>,
    hub: Arc<Hub>,
    client: Arc<ClientHandle>,
    channel: ChannelName,
    job_id: JobId,
    subscription: Subscription,
) {
    let conn_id = client.conn_id();
    let token = subscription.token().clone();

    let mut stream = tokio::select! {
        _ = token.cancelled() => return,
        stream = queue.subscribe(job_id) => match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, job_id = %job_id, error = %e, "Job bridge could not subscribe");
                client.release_subscription(&channel, subscription.id());
                return;
            }
        },
    };
    tracing::debug!(conn_id = %conn_id, job_id = %job_id, "Job bridge started");

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            event = stream.recv() => Some(event),
        };
        let Some(event) = next else {
            queue.unsubscribe(stream);
            tracing::debug!(conn_id = %conn_id, job_id = %job_id, "Job bridge cancelled");
            return;
        };
        let Some(snapshot) = event else {
            break;
        };

        let terminal = snapshot.is_terminal();
        if !hub.send_to(conn_id, ServerMessage::job_progress(snapshot)).await {
            queue.unsubscribe(stream);
            break;
        }
        if terminal {
            break;
        }
    }

    client.release_subscription(&channel, subscription.id());
    tracing::debug!(conn_id = %conn_id, job_id = %job_id, "Job bridge finished");
}
