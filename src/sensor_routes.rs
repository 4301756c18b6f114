//! HTTP surface of the gateway: thin handlers mapping routes onto
//! coordinator-guarded sensor operations.
//!
//! Every handler here is a finite operation: it acquires the sensor lease up
//! front (503 if another request holds it) and releases it on all exit paths
//! by dropping the lease, including mid-stream disconnects. The identify
//! WebSocket lives in `identify_stream` and is exempt from the gate.
use actix_web::http::header;
use actix_web::{delete, get, post, put, web, HttpRequest, HttpResponse};
use async_stream::try_stream;
use bytes::Bytes;
use futures_util::Stream;
use metrics::counter;
use serde::Deserialize;
use tracing::{info, warn};

use crate::coordinator::{AppState, SensorLease};
use crate::error::GatewayError;
use crate::fpc_codec::{Fpc2534, Response, SensorEvent, StateFlag, SystemConfig, TEMPLATE_SIZE};
use crate::sensor_ops::{
    await_enroll_result, download_stream, ensure_idle, get_status, is_enroll_noise, push_template,
    transact, STREAM_IDLE_TIMEOUT,
};

/// Sensor app codes the routes translate into dedicated HTTP statuses.
const APP_CODE_TEMPLATE_EXISTS: u16 = 20;
const APP_CODE_TEMPLATE_NOT_FOUND: u16 = 21;
const APP_CODE_NO_IMAGE: u16 = 43;

fn acquire(state: &AppState) -> Result<SensorLease, GatewayError> {
    state.coordinator.acquire().map_err(|error| {
        counter!("fpc.http.busy").increment(1);
        error
    })
}

fn octet_stream(
    total: u32,
    body: impl Stream<Item = Result<Bytes, GatewayError>> + 'static,
) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/octet-stream")
        .no_chunking(u64::from(total))
        .streaming(body)
}

#[get("/sensor/status")]
async fn sensor_status(state: web::Data<AppState>) -> Result<HttpResponse, GatewayError> {
    let state = state.get_ref();
    let mut lease = acquire(state)?;
    let status = get_status(state, &mut lease, false).await?;
    Ok(HttpResponse::Ok().json(status))
}

#[get("/sensor/version")]
async fn sensor_version(state: web::Data<AppState>) -> Result<HttpResponse, GatewayError> {
    let state = state.get_ref();
    let mut lease = acquire(state)?;
    let frame = state.encode(Fpc2534::version)?;
    let reply = transact(state, &mut lease, frame).await?;
    Ok(HttpResponse::Ok().json(reply))
}

#[get("/sensor/templates")]
async fn list_templates(state: web::Data<AppState>) -> Result<HttpResponse, GatewayError> {
    let state = state.get_ref();
    let mut lease = acquire(state)?;
    let frame = state.encode(Fpc2534::list_templates)?;
    let reply = transact(state, &mut lease, frame).await?;
    Ok(HttpResponse::Ok().json(reply))
}

#[get("/sensor/templates/{id}")]
async fn download_template(
    state: web::Data<AppState>,
    path: web::Path<u16>,
) -> Result<HttpResponse, GatewayError> {
    let state = state.get_ref();
    let id = path.into_inner();
    let mut lease = acquire(state)?;
    ensure_idle(state, &mut lease).await?;

    let frame = state.encode(|codec| codec.download_template(id))?;
    match transact(state, &mut lease, frame).await? {
        Response::TemplateInfo { total_size, .. } => {
            info!(id, total_size, "template download starting");
            let total = u32::from(total_size);
            let body = download_stream(state.clone(), lease, total);
            Ok(octet_stream(total, body))
        }
        reply if reply.app_fail_code() == Some(APP_CODE_TEMPLATE_NOT_FOUND) => {
            Ok(HttpResponse::NotFound().body(format!("Template {id} not found")))
        }
        _ => Err(GatewayError::UnexpectedReply {
            context: "requesting template download",
        }),
    }
}

#[put("/sensor/templates/{id}")]
async fn upload_template(
    state: web::Data<AppState>,
    path: web::Path<u16>,
    body: web::Bytes,
) -> Result<HttpResponse, GatewayError> {
    let state = state.get_ref();
    let id = path.into_inner();
    if body.len() != TEMPLATE_SIZE {
        return Err(GatewayError::TemplateSize {
            expected: TEMPLATE_SIZE,
            got: body.len(),
        });
    }

    let mut lease = acquire(state)?;
    ensure_idle(state, &mut lease).await?;

    let frame = state.encode(|codec| codec.upload_template(id, TEMPLATE_SIZE as u16))?;
    match transact(state, &mut lease, frame).await? {
        Response::TemplateSlot { .. } => {}
        reply if reply.app_fail_code() == Some(APP_CODE_TEMPLATE_EXISTS) => {
            return Ok(HttpResponse::Conflict().body("Template already exists"));
        }
        _ => {
            return Err(GatewayError::UnexpectedReply {
                context: "requesting template upload",
            });
        }
    }

    push_template(state, &mut lease, &body).await?;
    info!(id, "template upload complete");
    Ok(HttpResponse::Ok().body("ok"))
}

#[delete("/sensor/templates/{id}")]
async fn delete_template(
    state: web::Data<AppState>,
    path: web::Path<u16>,
) -> Result<HttpResponse, GatewayError> {
    let state = state.get_ref();
    let id = path.into_inner();
    let mut lease = acquire(state)?;
    let frame = state.encode(|codec| codec.delete_template(id))?;
    let reply = transact(state, &mut lease, frame).await?;
    Ok(HttpResponse::Ok().json(reply))
}

#[get("/sensor/image")]
async fn capture_image(state: web::Data<AppState>) -> Result<HttpResponse, GatewayError> {
    let state = state.get_ref();
    let mut lease = acquire(state)?;
    ensure_idle(state, &mut lease).await?;

    let frame = state.encode(Fpc2534::capture)?;
    transact(state, &mut lease, frame).await?;

    // wait out the touch; the finger-lost event tells us whether an image
    // was actually captured
    let image_available = loop {
        match lease.recv_within(STREAM_IDLE_TIMEOUT).await? {
            Response::Status {
                event: SensorEvent::FingerLost,
                states,
                ..
            } => break states.contains(&StateFlag::ImageAvailable),
            other => {
                warn!(?other, "event ignored while waiting for capture");
            }
        }
    };
    if !image_available {
        return Ok(HttpResponse::InternalServerError().body("Failed capturing image"));
    }

    let frame = state.encode(Fpc2534::request_image_data)?;
    match transact(state, &mut lease, frame).await? {
        Response::ImageData { size, width, height, .. } => {
            info!(size, width, height, "image download starting");
            let body = download_stream(state.clone(), lease, size);
            Ok(octet_stream(size, body))
        }
        reply if reply.app_fail_code() == Some(APP_CODE_NO_IMAGE) => {
            Ok(HttpResponse::NotFound().body("No image available"))
        }
        _ => Err(GatewayError::UnexpectedReply {
            context: "requesting image data",
        }),
    }
}

async fn get_config(state: &AppState, default: bool) -> Result<HttpResponse, GatewayError> {
    let mut lease = acquire(state)?;
    let frame = state.encode(|codec| codec.get_system_config(default))?;
    let reply = transact(state, &mut lease, frame).await?;
    Ok(HttpResponse::Ok().json(reply))
}

#[get("/sensor/config/current")]
async fn get_config_current(state: web::Data<AppState>) -> Result<HttpResponse, GatewayError> {
    get_config(state.get_ref(), false).await
}

#[get("/sensor/config/default")]
async fn get_config_default(state: web::Data<AppState>) -> Result<HttpResponse, GatewayError> {
    get_config(state.get_ref(), true).await
}

/// Accepts the JSON a config GET produced; the `type` field clients echo
/// back is stripped by the encoder.
async fn set_config(
    state: web::Data<AppState>,
    body: web::Json<SystemConfig>,
) -> Result<HttpResponse, GatewayError> {
    let state = state.get_ref();
    let mut lease = acquire(state)?;
    let frame = state.encode(|codec| codec.set_system_config(&body))?;
    let reply = transact(state, &mut lease, frame).await?;
    Ok(HttpResponse::Ok().json(reply))
}

/// Raw key bytes in the body. The length check runs before the sensor is
/// contacted; after the sensor acknowledges, the gateway codec is swapped so
/// subsequent traffic uses the new key.
async fn set_key(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, GatewayError> {
    let state = state.get_ref();
    let frame = state.encode(|codec| codec.set_key(&body))?;
    let mut lease = acquire(state)?;
    let reply = transact(state, &mut lease, frame).await?;
    state.swap_codec(Fpc2534::new(Some(body.as_ref()))?);
    info!(bytes = body.len(), "gateway codec rekeyed");
    Ok(HttpResponse::Ok().json(reply))
}

#[derive(Debug, Deserialize)]
struct EnrollQuery {
    template_id: Option<u16>,
}

fn enroll_event_stream(mut lease: SensorLease) -> impl Stream<Item = Result<Bytes, GatewayError>> {
    try_stream! {
        loop {
            let event = lease.recv_within(STREAM_IDLE_TIMEOUT).await?;
            let noise = is_enroll_noise(&event);
            let mut line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            line.push('\n');
            yield Bytes::from(line);
            if !noise {
                // terminal event emitted; drain and emit the trailing
                // finger-lost before releasing the sensor
                if let Ok(trailing) = lease.recv_within(STREAM_IDLE_TIMEOUT).await {
                    let mut line =
                        serde_json::to_string(&trailing).unwrap_or_else(|_| "{}".to_string());
                    line.push('\n');
                    yield Bytes::from(line);
                }
                break;
            }
        }
    }
}

#[post("/sensor/enroll")]
async fn enroll(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<EnrollQuery>,
) -> Result<HttpResponse, GatewayError> {
    let state = state.get_ref();
    let streaming = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("multipart/related"));

    let mut lease = acquire(state)?;
    ensure_idle(state, &mut lease).await?;

    let frame = state.encode(|codec| codec.enroll_finger(query.template_id))?;
    let reply = transact(state, &mut lease, frame).await?;
    let armed = matches!(
        &reply,
        Response::Status { states, .. } if states.contains(&StateFlag::Enroll)
    );
    if !armed {
        warn!(?reply, "sensor did not enter enroll state");
        return Ok(HttpResponse::InternalServerError().json(reply));
    }
    counter!("fpc.enroll.started").increment(1);

    if streaming {
        return Ok(HttpResponse::Ok()
            .content_type("application/x-ndjson")
            .streaming(enroll_event_stream(lease)));
    }
    let result = await_enroll_result(&mut lease).await?;
    Ok(HttpResponse::Ok().json(result))
}

#[post("/sensor/reset")]
async fn reset(state: web::Data<AppState>) -> Result<HttpResponse, GatewayError> {
    let state = state.get_ref();
    let mut lease = acquire(state)?;
    let frame = state.encode(Fpc2534::reset)?;
    let reply = transact(state, &mut lease, frame).await?;
    Ok(HttpResponse::Ok().json(reply))
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(sensor_status)
        .service(sensor_version)
        .service(list_templates)
        .service(download_template)
        .service(upload_template)
        .service(delete_template)
        .service(capture_image)
        .service(get_config_current)
        .service(get_config_default)
        .service(enroll)
        .service(reset)
        .route("/sensor/config", web::put().to(set_config))
        .route("/sensor/config", web::post().to(set_config))
        .route("/sensor/config/current", web::put().to(set_config))
        .route("/sensor/config/current", web::post().to(set_config))
        .route("/sensor/key", web::put().to(set_key))
        .route("/sensor/key", web::post().to(set_key));
}
