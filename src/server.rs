use actix_web::{HttpRequest, HttpResponse, HttpServer, get, post, web};
use serde_json::json;
use std::io::Write;

use crate::app_state::AppState;
use crate::io_struct::{ChatReqInput, SubmitJobReqInput};
use crate::job_store::Job;

#[get("/health")]
pub async fn health(_req: HttpRequest, app_state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "pool_size": app_state.pool.len(),
        "running_jobs": app_state.store.running_count(),
        "cooldown": app_state.dispatcher.cooldown_active(),
    }))
}

#[post("/chat")]
pub async fn chat(
    _req: HttpRequest,
    req: web::Json<ChatReqInput>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    match app_state.dispatcher.dispatch_chat(&req.into_inner()).await {
        Ok(resp) => Ok(HttpResponse::Ok().json(resp)),
        Err(e) => {
            log::error!("Chat error: {e}");
            Err(actix_web::error::ErrorServiceUnavailable(e.to_string()))
        }
    }
}

#[post("/jobs")]
pub async fn submit_job(
    _req: HttpRequest,
    req: web::Json<SubmitJobReqInput>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let req = req.into_inner();
    let job_id = req
        .id
        .clone()
        .unwrap_or_else(|| format!("job-{:016x}", rand::random::<u64>()));

    if app_state.store.get(&job_id).is_some() {
        return Err(actix_web::error::ErrorBadRequest(format!(
            "Job {job_id} already exists"
        )));
    }
    app_state.store.insert(Job::new(job_id.clone()));

    match app_state.dispatcher.submit_job(&job_id, &req).await {
        Ok(resp) => Ok(HttpResponse::Ok().json(resp)),
        Err(e) => Err(actix_web::error::ErrorServiceUnavailable(e.to_string())),
    }
}

#[get("/jobs/{job_id}")]
pub async fn get_job(
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let job_id = path.into_inner();
    match app_state.store.get(&job_id) {
        Some(job) => Ok(HttpResponse::Ok().json(job)),
        None => Err(actix_web::error::ErrorNotFound(format!(
            "Job {job_id} not found"
        ))),
    }
}

#[post("/admin/reload")]
pub async fn reload_pool(
    _req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    app_state
        .pool
        .reload(&app_state.config.key_dir, &app_state.config.region);
    // Best effort: a missing bucket degrades later dispatches, not this call.
    if let Err(e) = app_state.storage.ensure_bucket().await {
        log::warn!(
            "Failed to ensure bucket {} exists: {e}",
            app_state.config.bucket_name
        );
    }
    Ok(HttpResponse::Ok().json(json!({"pool_size": app_state.pool.len()})))
}

pub async fn startup(app_state: AppState) -> std::io::Result<()> {
    let config = app_state.config.clone();
    println!("Starting server at {}:{}", config.host, config.port);

    // default level is info
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .init();

    log::info!("Active project pool size: {}", app_state.pool.len());
    if let Err(e) = app_state.storage.ensure_bucket().await {
        log::warn!("Failed to ensure bucket {} exists: {e}", config.bucket_name);
    }

    let app_state = web::Data::new(app_state);
    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .service(health)
            .service(chat)
            .service(submit_job)
            .service(get_job)
            .service(reload_pool)
    })
    .bind((config.host, config.port))?
    .run()
    .await?;

    std::io::Result::Ok(())
}
