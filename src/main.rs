use actix_files::NamedFile;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{get, route, web, App, Either, HttpRequest, HttpResponse, HttpServer, Responder};
use tera::Tera;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod message_log;

use config::Config;
use message_log::{History, MessageLog};

struct AppState {
    tera: Tera,
    log: MessageLog,
    files_dir: PathBuf,
}

#[derive(Deserialize)]
struct MessagePayload {
    message: String,
}

// Serialization object for the polling endpoint
#[derive(Serialize)]
struct HistoryDso {
    history: History,
}

#[get("/static/{filename:.*}")]
async fn get_static(req: HttpRequest) -> actix_web::Result<NamedFile> {
    let rel: PathBuf = req.match_info().query("filename").parse().unwrap();
    Ok(NamedFile::open(Path::new("static").join(rel))?)
}

#[get("/")]
async fn get_index(data: web::Data<AppState>) -> impl Responder {
    let mut context = tera::Context::new();
    context.insert("history", &data.log.snapshot());

    match data.tera.render("index.html", &context) {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(body),
        Err(e) => {
            error!("could not render index: {}", e);
            HttpResponse::InternalServerError().body("template error")
        }
    }
}

#[route(
    "/message",
    method = "POST",
    method = "GET",
    method = "PUT",
    method = "DELETE"
)]
async fn handle_message(
    req: HttpRequest,
    body: web::Bytes,
    data: web::Data<AppState>,
) -> impl Responder {
    let ip = client_ip(&req);
    let method = req.method().as_str().to_string();

    // Only bodied verbs carry a message; malformed JSON is tolerated.
    let message = if method == "POST" || method == "PUT" {
        serde_json::from_slice::<MessagePayload>(&body)
            .ok()
            .map(|p| p.message)
            .filter(|m| !m.is_empty())
    } else {
        None
    };

    if let Some(text) = &message {
        info!("{} message from {}", method, ip);
        data.log.append(&method, text, &ip);
    }

    if method == "POST" {
        HttpResponse::Ok().json(json!({
            "status": "success",
            "message": "Message received",
            "your_message": message,
            "ip": ip,
        }))
    } else {
        HttpResponse::Ok().json(json!({
            "status": "success",
            "method": method,
            "message": "Request handled",
            "ip": ip,
        }))
    }
}

#[get("/get-messages")]
async fn get_messages(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(HistoryDso {
        history: data.log.snapshot(),
    })
}

#[get("/admin-message")]
async fn admin_message(data: web::Data<AppState>) -> impl Responder {
    match data.log.last_admin_message() {
        Some(record) => HttpResponse::Ok().body(record.message),
        None => HttpResponse::Ok().body("No admin messages"),
    }
}

#[get("/download/{filename}")]
async fn download_file(
    req: HttpRequest,
    data: web::Data<AppState>,
) -> Either<NamedFile, HttpResponse> {
    let filename = req.match_info().query("filename").to_string();
    if !is_plain_filename(&filename) {
        return Either::Right(HttpResponse::NotFound().body("File not found"));
    }

    match NamedFile::open(data.files_dir.join(&filename)) {
        Ok(file) => Either::Left(file.set_content_disposition(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(filename)],
        })),
        Err(_) => Either::Right(HttpResponse::NotFound().body("File not found")),
    }
}

// One path component, no traversal.
fn is_plain_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

// First X-Forwarded-For entry wins, then the socket peer address. The log
// strips any trailing port itself.
fn client_ip(req: &HttpRequest) -> String {
    req.headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| req.peer_addr().map(|a| a.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    let log = MessageLog::open(
        config.history_file.clone(),
        config.max_history,
        config.admin_ip.clone(),
        config.policy.clone(),
        config.resolve_hostnames,
    );

    let tera = match Tera::new("templates/*.html") {
        Ok(t) => t,
        Err(e) => {
            error!("template parsing error: {}", e);
            ::std::process::exit(1);
        }
    };

    let app_data = web::Data::new(AppState {
        tera,
        log,
        files_dir: config.files_dir.clone(),
    });

    let server_data = app_data.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(server_data.clone())
            .service(get_static)
            .service(get_index)
            .service(get_messages)
            .service(admin_message)
            .service(handle_message)
            .service(download_file)
    })
    .bind(&config.bind_addr)?
    .disable_signals()
    .run();

    info!("listening on {}", config.bind_addr);

    // Flush the history once more, then stop the server gracefully.
    use futures::executor::block_on;
    let handle = server.handle();
    ctrlc::set_handler(move || {
        app_data.log.persist_now();
        info!("history flushed, shutting down");
        block_on(handle.stop(false));
    })
    .expect("Could not setup ctrl-c handler");

    server.await
}
