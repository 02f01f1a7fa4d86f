use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use epicast::{
    config::EpicastConfig,
    data::{
        ingest::{DataSource, OwidSource},
        location_index::{DisplayNameLookup, IsoNameTable},
        prediction_data::PredictionService,
    },
    error::EpicastError,
    logging::setup_tracing,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

struct AppState {
    service: PredictionService<OwidSource>,
}

#[derive(Debug, Deserialize)]
struct SourceQuery {
    /// Snapshot file name inside the data directory; the configured source when absent.
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    file: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct LatestDate {
    file: String,
    latest_date: chrono::NaiveDate,
}

/// Maps a failed operation to its HTTP status by error kind.
fn error_response(e: EpicastError) -> HttpResponse {
    let body = ErrorBody {
        error: e.to_string(),
    };
    match e {
        EpicastError::UnknownIdentifier(_) | EpicastError::IndexOutOfRange { .. } => {
            HttpResponse::NotFound().json(body)
        }
        EpicastError::Io(ref err) if err.kind() == io::ErrorKind::NotFound => {
            HttpResponse::NotFound().json(body)
        }
        ref e if e.is_transient() => {
            warn!("Upstream failure: {}", e);
            HttpResponse::BadGateway().json(body)
        }
        EpicastError::BuildAborted(_)
        | EpicastError::Config(_)
        | EpicastError::SerdeYaml(_)
        | EpicastError::Io(_) => {
            error!("Request failed: {}", body.error);
            HttpResponse::InternalServerError().json(body)
        }
        _ => HttpResponse::UnprocessableEntity().json(body),
    }
}

/// Resolves a client-supplied snapshot name inside `data_dir`. Only bare, non-hidden file
/// names are accepted.
fn snapshot_path(data_dir: &Path, name: &str) -> Option<PathBuf> {
    let bare = Path::new(name)
        .file_name()
        .is_some_and(|file_name| file_name == name);
    (bare && !name.starts_with('.')).then(|| data_dir.join(name))
}

fn bad_snapshot_name(name: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorBody {
        error: format!("{} is not a snapshot file name", name),
    })
}

impl AppState {
    fn source(&self, query: &SourceQuery) -> Result<DataSource, HttpResponse> {
        let config = self.service.config();
        match &query.source {
            None => Ok(config.data_source()),
            Some(name) => snapshot_path(&config.data_dir, name)
                .map(DataSource::File)
                .ok_or_else(|| bad_snapshot_name(name)),
        }
    }
}

async fn health() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

async fn get_config(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.service.config())
}

async fn get_locations(
    query: web::Query<SourceQuery>,
    state: web::Data<AppState>,
) -> impl Responder {
    let source = match state.source(&query) {
        Ok(source) => source,
        Err(response) => return response,
    };
    match state.service.location_options(&source).await {
        Ok(options) => HttpResponse::Ok().json(options),
        Err(e) => error_response(e),
    }
}

async fn get_location(
    path: web::Path<usize>,
    query: web::Query<SourceQuery>,
    state: web::Data<AppState>,
) -> impl Responder {
    let source = match state.source(&query) {
        Ok(source) => source,
        Err(response) => return response,
    };
    match state.service.location_window(&source, path.into_inner()).await {
        Ok(selection) => HttpResponse::Ok().json(selection),
        Err(e) => error_response(e),
    }
}

async fn get_latest_date(
    query: web::Query<SnapshotQuery>,
    state: web::Data<AppState>,
) -> impl Responder {
    let file = query.into_inner().file;
    let Some(path) = snapshot_path(&state.service.config().data_dir, &file) else {
        return bad_snapshot_name(&file);
    };
    match state.service.latest_date(&path).await {
        Ok(latest_date) => HttpResponse::Ok().json(LatestDate { file, latest_date }),
        Err(e) => error_response(e),
    }
}

async fn invalidate_cache(
    query: web::Query<SourceQuery>,
    state: web::Data<AppState>,
) -> impl Responder {
    let source = match state.source(&query) {
        Ok(source) => source,
        Err(response) => return response,
    };
    state.service.invalidate(&source).await;
    HttpResponse::Ok().body("cache invalidated")
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/config", web::get().to(get_config))
        .route("/latest-date", web::get().to(get_latest_date))
        .route("/locations", web::get().to(get_locations))
        .route("/locations/{index}", web::get().to(get_location))
        .route("/cache/invalidate", web::post().to(invalidate_cache));
}

fn load_names(config: &EpicastConfig) -> Result<Arc<dyn DisplayNameLookup>, EpicastError> {
    if config.iso_names.exists() {
        Ok(Arc::new(IsoNameTable::from_path(&config.iso_names)?))
    } else {
        warn!(
            "Display name table {} not found; only aggregates can be labelled",
            config.iso_names.display()
        );
        Ok(Arc::new(IsoNameTable::default()))
    }
}

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = setup_tracing(Some("logs"))?;
    let config = EpicastConfig::read_config::<&str>(None)?;
    let names = load_names(&config)?;
    let records = OwidSource::new(config.http_timeout());
    let app_state = web::Data::new(AppState {
        service: PredictionService::new(config, records, names),
    });

    info!("Serving prediction data on 0.0.0.0:8080");
    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(app_state.clone())
            .configure(routes)
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await?;
    Ok(())
}
