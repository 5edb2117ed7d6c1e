use actix_files::NamedFile;
use actix_identity::Identity;
use actix_web::{
    get,
    http::{
        header::{ContentDisposition, DispositionParam, DispositionType},
        StatusCode,
    },
    post,
    web::{self, Data},
    HttpRequest, HttpResponse,
};
use serde::{Deserialize, Serialize};

use crate::{
    backup, db,
    errors::AppError,
    qr,
    routes::{base_context, current_user, flash_outcome, redirect, render, Flash},
    structs::{Tool, User},
    AppState,
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .service(admin_panel_handler)
            .service(add_tool_handler)
            .service(remove_tool_handler)
            .service(add_user_handler)
            .service(remove_user_handler)
            .service(backup_handler)
            .service(download_backup_handler)
            .service(restore_handler)
            .service(reset_handler)
            .service(regenerate_qr_handler)
            // before `/qr/{id}`, which would otherwise match "download"
            .service(download_qr_codes_handler)
            .service(qr_image_handler)
            .service(qr_payload_handler)
            .service(download_logs_handler),
    );
}

fn attachment(file_name: String) -> ContentDisposition {
    ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters: vec![DispositionParam::Filename(file_name)],
    }
}

/// Resolves the caller to an admin, or the response to send instead.
async fn require_admin(
    state: &AppState,
    identity: Option<Identity>,
) -> Result<Result<User, HttpResponse>, AppError> {
    match current_user(state, identity).await? {
        None => Ok(Err(redirect("/login"))),
        Some(user) if !user.is_admin => {
            log::warn!("User '{}' tried to reach the admin panel", user.username);
            Ok(Err(HttpResponse::Forbidden().body(AppError::Forbidden.to_string())))
        }
        Some(user) => Ok(Ok(user)),
    }
}

#[derive(Serialize)]
struct LogRow {
    timestamp: String,
    user: String,
    tool: String,
    action: String,
    details: String,
}

async fn admin_page(
    state: &AppState,
    user: &User,
    message: Option<Flash>,
    status: StatusCode,
) -> Result<HttpResponse, AppError> {
    let tools = db::list_tools(state).await?;
    let users = db::list_users(state).await?;
    let logs: Vec<LogRow> = db::list_logs(state)
        .await?
        .into_iter()
        .map(|log| LogRow {
            timestamp: log.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            user: log.username,
            tool: log.tool_name,
            action: log.action,
            details: log.details.unwrap_or_else(|| "None".to_owned()),
        })
        .collect();
    let latest_backup = backup::latest_backup(&state.backup_dir)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));

    let mut context = base_context("Admin panel", Some(user));
    context.insert("tools", &tools);
    context.insert("users", &users);
    context.insert("logs", &logs);
    context.insert("latest_backup", &latest_backup);
    context.insert("message", &message);
    render("admin_panel.html", &context, status)
}

/// Runs an admin action and re-renders the panel with its outcome.
macro_rules! admin_action {
    ($state:expr, $identity:expr, $action:expr, $on_success:expr) => {{
        let user = match require_admin(&$state, $identity).await? {
            Ok(user) => user,
            Err(response) => return Ok(response),
        };
        let (message, status) = flash_outcome($action.await, $on_success)?;
        admin_page(&$state, &user, Some(message), status).await
    }};
}

#[get("")]
pub async fn admin_panel_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    let user = match require_admin(&state, identity).await? {
        Ok(user) => user,
        Err(response) => return Ok(response),
    };
    admin_page(&state, &user, None, StatusCode::OK).await
}

#[derive(Deserialize)]
pub struct AddToolForm {
    tool_name: String,
    tool_location: String,
}

#[post("/tools")]
pub async fn add_tool_handler(
    web::Form(form): web::Form<AddToolForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    admin_action!(
        state,
        identity,
        db::add_tool(&state, &form.tool_name, &form.tool_location),
        |tool: Tool| format!("Tool '{}' added", tool.name)
    )
}

#[derive(Deserialize)]
pub struct IdForm {
    id: i64,
}

#[post("/tools/remove")]
pub async fn remove_tool_handler(
    web::Form(form): web::Form<IdForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    admin_action!(
        state,
        identity,
        db::remove_tool(&state, form.id),
        |tool: Tool| format!("Tool '{}' removed", tool.name)
    )
}

#[derive(Deserialize)]
pub struct AddUserForm {
    username: String,
    password: String,
    #[serde(default)]
    is_admin: Option<String>,
}

#[post("/users")]
pub async fn add_user_handler(
    web::Form(form): web::Form<AddUserForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    let is_admin = form.is_admin.is_some();
    admin_action!(
        state,
        identity,
        db::add_user(&state, &form.username, &form.password, is_admin),
        |user: User| format!("User '{}' added", user.username)
    )
}

#[post("/users/remove")]
pub async fn remove_user_handler(
    web::Form(form): web::Form<IdForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    admin_action!(
        state,
        identity,
        db::remove_user(&state, form.id),
        |user: User| format!("User '{}' removed", user.username)
    )
}

#[post("/backup")]
pub async fn backup_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    admin_action!(
        state,
        identity,
        backup::backup_database(&state),
        |path: std::path::PathBuf| format!("Database backup created: {}", path.display())
    )
}

#[get("/backup/latest")]
pub async fn download_backup_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    request: HttpRequest,
) -> Result<HttpResponse, AppError> {
    if let Err(response) = require_admin(&state, identity).await? {
        return Ok(response);
    }
    let path = backup::latest_backup(&state.backup_dir)?;
    let file = NamedFile::open_async(&path).await?;
    Ok(file
        .set_content_disposition(attachment(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "backup.sql".to_owned()),
        ))
        .into_response(&request))
}

#[post("/restore")]
pub async fn restore_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    admin_action!(
        state,
        identity,
        backup::restore_latest(&state),
        |path: std::path::PathBuf| format!("Database restored from {}", path.display())
    )
}

#[post("/reset")]
pub async fn reset_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    admin_action!(
        state,
        identity,
        db::reset_rented_items(&state),
        |count: usize| format!("{} rented items reset to available", count)
    )
}

#[post("/qr/regenerate")]
pub async fn regenerate_qr_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    admin_action!(
        state,
        identity,
        db::regenerate_qr_codes(&state),
        |count: usize| format!("QR codes regenerated for {} tools", count)
    )
}

/// Every tool's QR code as a printable PNG, zipped.
#[get("/qr/download")]
pub async fn download_qr_codes_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    if let Err(response) = require_admin(&state, identity).await? {
        return Ok(response);
    }
    let tools = db::list_tools(&state).await?;
    let bytes = qr::archive(&tools)?;
    log::info!("QR code archive generated for {} tools", tools.len());
    Ok(HttpResponse::Ok()
        .content_type("application/zip")
        .insert_header(attachment(qr::ARCHIVE_NAME.to_owned()))
        .body(bytes))
}

#[get("/qr/{id}/png")]
pub async fn qr_image_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    path: web::Path<i64>,
) -> Result<HttpResponse, AppError> {
    if let Err(response) = require_admin(&state, identity).await? {
        return Ok(response);
    }
    let tool = db::get_tool(&state, path.into_inner()).await?;
    let payload = tool
        .qr_code
        .as_deref()
        .ok_or_else(|| AppError::InvalidInput(format!("Tool '{}' has no QR code", tool.name)))?;
    let png = qr::render_png(payload)?;
    Ok(HttpResponse::Ok()
        .content_type("image/png")
        .insert_header(attachment(qr::image_file_name(&tool)))
        .body(png))
}

/// Raw payload for one tool.
#[get("/qr/{id}")]
pub async fn qr_payload_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    path: web::Path<i64>,
) -> Result<HttpResponse, AppError> {
    if let Err(response) = require_admin(&state, identity).await? {
        return Ok(response);
    }
    let tool = db::get_tool(&state, path.into_inner()).await?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(tool.qr_code.unwrap_or_default()))
}

#[get("/logs/download")]
pub async fn download_logs_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    if let Err(response) = require_admin(&state, identity).await? {
        return Ok(response);
    }
    let content = db::export_logs(&state).await?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .insert_header(attachment("logs.txt".to_owned()))
        .body(content))
}
