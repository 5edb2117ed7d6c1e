use actix_files::Files;
use actix_identity::Identity;
use actix_web::{
    get,
    http::{Method, StatusCode},
    post,
    web::{self, Data},
    HttpMessage, HttpRequest, HttpResponse, Responder,
};
use serde::{Deserialize, Serialize};
use tera::Context;

use crate::{
    admin, db,
    errors::AppError,
    lending::{self, format_duration, loan_age},
    qr,
    structs::{BorrowedItem, Tool, User},
    AppState, TEMPLATES,
};

/// Registers every handler; shared by `main` and the handler tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(Files::new("/static", "static"))
        .service(index_handler)
        .service(inventory_handler)
        .service(login_handler)
        .service(login_form_handler)
        .service(logout_handler)
        .service(logout_form_handler)
        .service(lend_handler)
        .service(lend_form_handler)
        .service(return_handler)
        .service(return_form_handler)
        .service(api_tools_handler)
        .service(api_resolve_handler)
        .configure(admin::configure)
        .default_service(web::to(default_handler));
}

/// Message shown at the top of a page after a form post.
#[derive(Serialize, Debug, Clone)]
pub struct Flash {
    pub kind: &'static str,
    pub text: String,
}

impl Flash {
    pub fn success(text: impl Into<String>) -> Self {
        Flash {
            kind: "success",
            text: text.into(),
        }
    }

    pub fn danger(text: impl Into<String>) -> Self {
        Flash {
            kind: "danger",
            text: text.into(),
        }
    }
}

/// Turns the outcome of a core operation into a page message.
/// Server-side failures are propagated instead.
pub fn flash_outcome<T>(
    result: Result<T, AppError>,
    on_success: impl FnOnce(T) -> String,
) -> Result<(Flash, StatusCode), AppError> {
    use actix_web::ResponseError;
    match result {
        Ok(value) => Ok((Flash::success(on_success(value)), StatusCode::OK)),
        Err(e) if e.is_user_facing() => {
            log::warn!("Request rejected: {}", e);
            let status = e.status_code();
            Ok((Flash::danger(e.to_string()), status))
        }
        Err(e) => Err(e),
    }
}

pub fn render(template: &str, context: &Context, status: StatusCode) -> Result<HttpResponse, AppError> {
    let rendered = TEMPLATES.render(template, context).map_err(|e| {
        log::error!("Failed to render template: {}", e);
        AppError::TemplateError(e)
    })?;
    Ok(HttpResponse::build(status)
        .content_type("text/html; charset=utf-8")
        .body(rendered))
}

pub fn redirect(location: &str) -> HttpResponse {
    HttpResponse::SeeOther()
        .append_header(("Location", location))
        .finish()
}

pub fn base_context(title: &str, user: Option<&User>) -> Context {
    let mut context = Context::new();
    context.insert("title", title);
    context.insert("version", env!("CARGO_PKG_VERSION"));
    context.insert("user", &user);
    context.insert("message", &None::<Flash>);
    context
}

/// The logged-in user, if the identity cookie names one that still exists.
pub async fn current_user(
    state: &AppState,
    identity: Option<Identity>,
) -> Result<Option<User>, AppError> {
    let Some(identity) = identity else {
        return Ok(None);
    };
    let id = identity
        .id()
        .map_err(|e| AppError::IdentityError(e.to_string()))?;
    let Ok(user_id) = id.parse::<i64>() else {
        log::warn!("Discarding identity with non-numeric id");
        identity.logout();
        return Ok(None);
    };
    match db::get_user(state, user_id).await {
        Ok(user) => Ok(Some(user)),
        Err(AppError::UserNotFound) => {
            identity.logout();
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[derive(Serialize)]
struct BorrowedRow {
    #[serde(flatten)]
    item: BorrowedItem,
    since: String,
    out_for: String,
}

fn borrowed_rows(items: Vec<BorrowedItem>) -> Vec<BorrowedRow> {
    items
        .into_iter()
        .map(|item| BorrowedRow {
            since: item.borrow_date.format("%Y-%m-%d %H:%M").to_string(),
            out_for: format_duration(loan_age(item.borrow_date)),
            item,
        })
        .collect()
}

#[get("/")]
pub async fn index_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    let user = current_user(&state, identity).await?;
    let borrowed = db::open_loans(&state).await?;

    let mut context = base_context("Borrowed tools", user.as_ref());
    context.insert("borrowed_items", &borrowed_rows(borrowed));
    render("index.html", &context, StatusCode::OK)
}

#[get("/inventory")]
pub async fn inventory_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    let user = current_user(&state, identity).await?;
    let tools = db::list_tools(&state).await?;

    let mut context = base_context("Inventory", user.as_ref());
    context.insert("tools", &tools);
    render("inventory.html", &context, StatusCode::OK)
}

#[derive(Deserialize)]
pub struct Login {
    username: String,
    password: String,
}

#[get("/login")]
pub async fn login_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    let user = current_user(&state, identity).await?;
    let context = base_context("Login", user.as_ref());
    render("login.html", &context, StatusCode::OK)
}

#[post("/login")]
pub async fn login_form_handler(
    web::Form(form): web::Form<Login>,
    state: Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, AppError> {
    if form.username.trim().is_empty() || form.password.is_empty() {
        let mut context = base_context("Login", None);
        context.insert("message", &Flash::danger("All fields are required"));
        return render("login.html", &context, StatusCode::BAD_REQUEST);
    }

    match db::authenticate(&state, &form.username, &form.password).await {
        Ok(user) => {
            Identity::login(&request.extensions(), user.id.to_string())
                .map_err(|e| AppError::IdentityError(e.to_string()))?;
            log::info!("User '{}' logged in", user.username);
            Ok(redirect("/lend"))
        }
        Err(AppError::InvalidCredentials) => {
            let mut context = base_context("Login", None);
            context.insert("message", &Flash::danger(AppError::InvalidCredentials.to_string()));
            render("login.html", &context, StatusCode::UNAUTHORIZED)
        }
        Err(e) => Err(e),
    }
}

#[get("/logout")]
pub async fn logout_handler(identity: Option<Identity>) -> impl Responder {
    if let Some(identity) = identity {
        identity.logout();
    }
    redirect("/login")
}

#[post("/logout")]
pub async fn logout_form_handler(identity: Option<Identity>) -> impl Responder {
    if let Some(identity) = identity {
        identity.logout();
    }
    redirect("/login")
}

/// Either a tool id typed or picked in the form, or the text of a scanned QR code.
#[derive(Deserialize)]
pub struct ToolForm {
    tool_id: Option<String>,
    qr_data: Option<String>,
}

async fn resolve_form_tool(state: &AppState, form: &ToolForm) -> Result<i64, AppError> {
    let non_empty = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };
    if let Some(raw) = non_empty(&form.tool_id) {
        return raw
            .parse()
            .map_err(|_| AppError::InvalidInput("tool_id must be a number".to_owned()));
    }
    if let Some(payload) = non_empty(&form.qr_data) {
        return qr::resolve_tool(state, &payload)
            .await?
            .map(|tool| tool.id)
            .ok_or(AppError::ToolNotFound);
    }
    Err(AppError::InvalidInput("Invalid request".to_owned()))
}

async fn lend_page(
    state: &AppState,
    user: &User,
    message: Option<Flash>,
    status: StatusCode,
) -> Result<HttpResponse, AppError> {
    let available = db::available_tools(state).await?;
    let borrowed = db::open_loans(state).await?;

    let mut context = base_context("Lend a tool", Some(user));
    context.insert("tools", &available);
    context.insert("borrowed_items", &borrowed_rows(borrowed));
    context.insert("message", &message);
    render("lend.html", &context, status)
}

#[get("/lend")]
pub async fn lend_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    let Some(user) = current_user(&state, identity).await? else {
        return Ok(redirect("/login"));
    };
    lend_page(&state, &user, None, StatusCode::OK).await
}

#[post("/lend")]
pub async fn lend_form_handler(
    web::Form(form): web::Form<ToolForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    let Some(user) = current_user(&state, identity).await? else {
        return Ok(redirect("/login"));
    };

    let outcome = match resolve_form_tool(&state, &form).await {
        Ok(tool_id) => lending::lend_tool(&state, tool_id, user.id).await,
        Err(e) => Err(e),
    };
    let (message, status) = flash_outcome(outcome, |_| "Tool lent successfully".to_owned())?;
    lend_page(&state, &user, Some(message), status).await
}

async fn return_page(
    state: &AppState,
    user: &User,
    message: Option<Flash>,
    status: StatusCode,
) -> Result<HttpResponse, AppError> {
    let borrowed = db::open_loans(state).await?;

    let mut context = base_context("Return a tool", Some(user));
    context.insert("borrowed_items", &borrowed_rows(borrowed));
    context.insert("message", &message);
    render("return.html", &context, status)
}

#[get("/return")]
pub async fn return_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    let Some(user) = current_user(&state, identity).await? else {
        return Ok(redirect("/login"));
    };
    return_page(&state, &user, None, StatusCode::OK).await
}

#[post("/return")]
pub async fn return_form_handler(
    web::Form(form): web::Form<ToolForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<HttpResponse, AppError> {
    let Some(user) = current_user(&state, identity).await? else {
        return Ok(redirect("/login"));
    };

    let outcome = match resolve_form_tool(&state, &form).await {
        Ok(tool_id) => lending::return_tool(&state, tool_id, user.id).await,
        Err(e) => Err(e),
    };
    let (message, status) = flash_outcome(outcome, |receipt| {
        format!(
            "{} returned successfully (borrowed by {} for {})",
            receipt.tool_name,
            receipt.borrower,
            format_duration(receipt.duration)
        )
    })?;
    return_page(&state, &user, Some(message), status).await
}

#[derive(Serialize, Debug)]
pub struct ToolStatus {
    pub id: i64,
    pub name: String,
    pub location: String,
    pub available: bool,
    pub rented_by: Option<String>,
}

impl From<Tool> for ToolStatus {
    fn from(tool: Tool) -> Self {
        ToolStatus {
            available: tool.state().is_available(),
            id: tool.id,
            name: tool.name,
            location: tool.location,
            rented_by: tool.rented_by,
        }
    }
}

#[get("/api/tools")]
pub async fn api_tools_handler(state: Data<AppState>) -> Result<HttpResponse, AppError> {
    let tools: Vec<ToolStatus> = db::list_tools(&state)
        .await?
        .into_iter()
        .map(ToolStatus::from)
        .collect();
    Ok(HttpResponse::Ok().json(tools))
}

#[derive(Deserialize)]
pub struct ResolveQuery {
    payload: String,
}

/// Lets a browser-side scanner check a code before submitting it.
#[get("/api/qr/resolve")]
pub async fn api_resolve_handler(
    state: Data<AppState>,
    query: web::Query<ResolveQuery>,
) -> Result<HttpResponse, AppError> {
    let tool = qr::resolve_tool(&state, &query.payload)
        .await?
        .ok_or(AppError::ToolNotFound)?;
    Ok(HttpResponse::Ok().json(ToolStatus::from(tool)))
}

async fn default_handler(req_method: Method) -> Result<HttpResponse, AppError> {
    match req_method {
        Method::GET => {
            let context = base_context("Not found", None);
            render("404.html", &context, StatusCode::NOT_FOUND)
        }
        _ => Ok(HttpResponse::MethodNotAllowed().finish()),
    }
}
