//! Background identify loop + `/sensor/identify` WebSocket endpoint.
//!
//! While at least one WebSocket subscriber is connected and no finite
//! operation holds the sensor, the loop keeps a sensor-side identify session
//! armed and fans every resulting event out to all subscriber queues. A
//! finite operation preempts it: the loop parks on `finite_done` and re-arms
//! once the operation releases the sensor.
use std::time::Duration;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use futures_util::StreamExt;
use metrics::counter;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info};

use crate::coordinator::AppState;
use crate::fpc_codec::{Response, SensorEvent, StateFlag};

/// Backoff before re-trying IDENTIFY when the sensor refused to enter
/// identify state.
const IDENTIFY_RETRY_DELAY: Duration = Duration::from_secs(10);

/// JSON form of a fanned-out event. Identify results gain the synthesized
/// EVENT_FINGER_MATCHED marker so subscribers need not inspect field shapes.
fn identify_event_json(response: &Response) -> Value {
    let mut value = serde_json::to_value(response).unwrap_or(Value::Null);
    if matches!(response, Response::Identify { .. }) {
        if let Value::Object(map) = &mut value {
            map.insert("event".into(), Value::String("EVENT_FINGER_MATCHED".into()));
        }
    }
    value
}

/// Singleton background task driving the infinite identify session.
pub async fn identify_loop(state: AppState, mut infinite_rx: UnboundedReceiver<Response>) {
    loop {
        state.coordinator.wait_for_subscriber().await;
        state.coordinator.wait_finite_released().await;

        let frame = match state.encode(|codec| codec.identify_finger(None)) {
            Ok(frame) => frame,
            Err(error) => {
                error!(%error, "identify encode failed");
                tokio::time::sleep(IDENTIFY_RETRY_DELAY).await;
                continue;
            }
        };
        if let Err(error) = state.sink.publish_frame(frame).await {
            error!(%error, "identify publish failed");
            tokio::time::sleep(IDENTIFY_RETRY_DELAY).await;
            continue;
        }
        let Some(reply) = infinite_rx.recv().await else {
            info!("infinite channel closed, identify loop exiting");
            return;
        };
        debug!(?reply, "identify response");

        let armed = matches!(
            &reply,
            Response::Status { states, .. } if states.contains(&StateFlag::Identify)
        );
        if !armed {
            debug!("sensor did not enter identify state, backing off");
            tokio::time::sleep(IDENTIFY_RETRY_DELAY).await;
            continue;
        }

        counter!("fpc.identify.armed").increment(1);
        state
            .coordinator
            .broadcast(&json!({ "event": "EVENT_IDENTIFY_STARTED" }));

        loop {
            let preempted = state.coordinator.on_finite_done().notified();
            tokio::select! {
                _ = preempted => {
                    // a finite op took (and released) the sensor; re-arm
                    debug!("identify preempted by finite operation");
                    break;
                }
                message = infinite_rx.recv() => {
                    let Some(response) = message else {
                        info!("infinite channel closed, identify loop exiting");
                        return;
                    };
                    let value = identify_event_json(&response);
                    let reached = state.coordinator.broadcast(&value);
                    counter!("fpc.identify.fanout").increment(1);
                    debug!(reached, "identify event fanned out");
                    if matches!(
                        &response,
                        Response::Status { event: SensorEvent::FingerLost, .. }
                    ) {
                        // sensor left identify state, must be re-armed
                        break;
                    }
                }
            }
        }
    }
}

/// WebSocket endpoint: registers a subscriber queue and streams identify
/// events until the client goes away. Exempt from the finite gate.
pub async fn identify_ws(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, body)?;
    let mut subscriber = state.coordinator.subscribe();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = subscriber.next_event() => {
                    let Some(value) = event else { break; };
                    if session.text(value.to_string()).await.is_err() {
                        break;
                    }
                }
                message = msg_stream.next() => {
                    match message {
                        Some(Ok(Message::Ping(bytes))) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
        info!("identify subscriber disconnected");
        let _ = session.close(None).await;
        // subscriber drops here and deregisters its queue
    });

    Ok(response)
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.route("/sensor/identify", web::get().to(identify_ws));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::sensor_ops::testing::{status_with, test_state, RecordingSink};

    async fn wait_for_frames(sink: &Arc<RecordingSink>, want: usize) {
        for _ in 0..200 {
            if sink.frame_count() >= want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never saw {want} published frames");
    }

    async fn expect_event(
        subscriber: &mut crate::coordinator::Subscriber,
        event: &str,
    ) {
        let value = tokio::time::timeout(Duration::from_secs(1), subscriber.next_event())
            .await
            .expect("no event fanned out")
            .expect("subscriber queue closed");
        assert_eq!(value["event"], event);
    }

    #[tokio::test]
    async fn idle_without_subscribers() {
        let (state, sink, infinite_rx) = test_state();
        tokio::spawn(identify_loop(state.clone(), infinite_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.frame_count(), 0);
    }

    #[tokio::test]
    async fn finite_operation_preempts_and_rearms() {
        let (state, sink, infinite_rx) = test_state();
        tokio::spawn(identify_loop(state.clone(), infinite_rx));

        let mut subscriber = state.coordinator.subscribe();
        wait_for_frames(&sink, 1).await;

        // sensor grants identify
        state
            .coordinator
            .route(status_with(SensorEvent::Idle, vec![StateFlag::Identify]));
        expect_event(&mut subscriber, "EVENT_IDENTIFY_STARTED").await;

        // give the loop time to park in its event race
        tokio::time::sleep(Duration::from_millis(20)).await;

        // a finite op takes the sensor; its traffic must not reach subscribers
        let lease = state.coordinator.acquire().unwrap();
        state
            .coordinator
            .route(status_with(SensorEvent::FingerDetect, vec![]));
        assert_eq!(sink.frame_count(), 1);
        drop(lease);

        // released: the loop re-arms with a fresh IDENTIFY
        wait_for_frames(&sink, 2).await;
        state
            .coordinator
            .route(status_with(SensorEvent::Idle, vec![StateFlag::Identify]));
        expect_event(&mut subscriber, "EVENT_IDENTIFY_STARTED").await;
    }

    #[tokio::test]
    async fn finger_lost_rearms_identify() {
        let (state, sink, infinite_rx) = test_state();
        tokio::spawn(identify_loop(state.clone(), infinite_rx));

        let mut subscriber = state.coordinator.subscribe();
        wait_for_frames(&sink, 1).await;
        state
            .coordinator
            .route(status_with(SensorEvent::Idle, vec![StateFlag::Identify]));
        expect_event(&mut subscriber, "EVENT_IDENTIFY_STARTED").await;

        // a match result is fanned out with the synthesized event marker
        state.coordinator.route(Response::Identify {
            finger_found: true,
            template_id: Some(7),
            tag: 0,
        });
        let value = tokio::time::timeout(Duration::from_secs(1), subscriber.next_event())
            .await
            .expect("no match event")
            .expect("subscriber queue closed");
        assert_eq!(value["event"], "EVENT_FINGER_MATCHED");
        assert_eq!(value["template_id"], 7);

        // finger leaves: loop re-arms
        state
            .coordinator
            .route(status_with(SensorEvent::FingerLost, vec![]));
        expect_event(&mut subscriber, "EVENT_FINGER_LOST").await;
        wait_for_frames(&sink, 2).await;
    }
}
