//! HTTP control surface.
//!
//! JSON over a TCP socket, one route family per subsystem. Mutating
//! handlers run on the blocking pool because they pause workers and spin on
//! the handshake.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::{json, Value};

use crate::error::{ControlError, ControlResult};
use crate::hub::{
    AddTcRequest, ConfigureGatehookRequest, GatehookCommandRequest, Hub, UpdateTcParamsRequest,
    UpdateTcParentRequest,
};
use crate::port::PortConf;

type AppState = Arc<Hub>;

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> ControlResult<T> + Send + 'static,
) -> ControlResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ControlError::Device(format!("control task panicked: {e}")))?
}

pub fn all_routes(hub: AppState) -> Router {
    Router::new()
        // Lifecycle
        .route("/version", get(get_version))
        .route("/status", get(get_status))
        .route("/pause_all", post(pause_all))
        .route("/resume_all", post(resume_all))
        .route("/reset_all", post(reset_all))
        .route("/kill", post(kill))
        // Workers
        .route("/workers", get(list_workers).post(add_worker))
        .route("/workers/{wid}", delete(destroy_worker))
        .route("/workers/{wid}/pause", post(pause_worker))
        .route("/workers/{wid}/resume", post(resume_worker))
        // Traffic classes
        .route("/tcs", get(list_tcs).post(add_tc))
        .route("/tcs/update_params", post(update_tc_params))
        .route("/tcs/update_parent", post(update_tc_parent))
        .route("/tcs/reset", post(reset_tcs))
        .route("/tcs/{name}", delete(destroy_tc))
        .route("/tcs/{name}/stats", get(get_tc_stats))
        .route("/constraints", get(check_constraints))
        // Ports
        .route("/drivers", get(list_drivers))
        .route("/drivers/{name}", get(get_driver_info))
        .route("/ports", get(list_ports).post(create_port))
        .route("/ports/reset", post(reset_ports))
        .route("/ports/{name}", delete(destroy_port))
        .route("/ports/{name}/conf", get(get_port_conf).post(set_port_conf))
        .route("/ports/{name}/stats", get(get_port_stats))
        .route("/ports/{name}/link", get(get_link_status))
        // Modules
        .route("/mclasses", get(list_mclasses))
        .route("/mclasses/{name}", get(get_mclass_info))
        .route("/modules", get(list_modules).post(create_module))
        .route("/modules/connect", post(connect_modules))
        .route("/modules/disconnect", post(disconnect_modules))
        .route("/modules/reset", post(reset_modules))
        .route("/modules/{name}", get(get_module_info).delete(destroy_module))
        .route("/modules/{name}/command", post(module_command))
        // Hooks
        .route("/gatehooks", get(list_gatehooks))
        .route("/gatehooks/classes", get(list_gatehook_classes))
        .route("/gatehooks/classes/{name}", get(get_gatehook_class_info))
        .route("/gatehooks/configure", post(configure_gatehook))
        .route("/gatehooks/command", post(gatehook_command))
        .route("/resume_hooks", post(configure_resume_hook))
        // Misc
        .route("/mempools", get(dump_mempool))
        .route("/attributes", get(list_attributes))
        .route("/plugins", get(list_plugins))
        .route("/plugins/import", post(import_plugin))
        .route("/plugins/unload", post(unload_plugin))
        .with_state(hub)
}

// ---------------------------------------------------------------- lifecycle

async fn get_version(State(hub): State<AppState>) -> Json<Value> {
    Json(json!({ "version": hub.version() }))
}

async fn get_status(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.status())
}

async fn pause_all(State(hub): State<AppState>) -> ControlResult<Json<Value>> {
    blocking(move || hub.pause_all()).await?;
    Ok(Json(json!({})))
}

async fn resume_all(State(hub): State<AppState>) -> ControlResult<Json<Value>> {
    blocking(move || hub.resume_all()).await?;
    Ok(Json(json!({})))
}

async fn reset_all(State(hub): State<AppState>) -> ControlResult<Json<Value>> {
    blocking(move || hub.reset_all()).await?;
    Ok(Json(json!({})))
}

async fn kill(State(hub): State<AppState>) -> Json<Value> {
    hub.kill();
    Json(json!({}))
}

// ---------------------------------------------------------------- workers

async fn list_workers(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.list_workers())
}

#[derive(serde::Deserialize)]
struct AddWorkerRequest {
    wid: usize,
    core: usize,
    #[serde(default)]
    scheduler: String,
}

async fn add_worker(
    State(hub): State<AppState>,
    Json(req): Json<AddWorkerRequest>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.add_worker(req.wid, req.core, &req.scheduler)).await?;
    Ok(Json(json!({})))
}

async fn destroy_worker(
    State(hub): State<AppState>,
    Path(wid): Path<usize>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.destroy_worker(wid)).await?;
    Ok(Json(json!({})))
}

async fn pause_worker(
    State(hub): State<AppState>,
    Path(wid): Path<usize>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.pause_worker(wid)).await?;
    Ok(Json(json!({})))
}

async fn resume_worker(
    State(hub): State<AppState>,
    Path(wid): Path<usize>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.resume_worker(wid)).await?;
    Ok(Json(json!({})))
}

// ---------------------------------------------------------------- tcs

async fn list_tcs(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.list_tcs())
}

async fn add_tc(
    State(hub): State<AppState>,
    Json(req): Json<AddTcRequest>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.add_tc(req)).await?;
    Ok(Json(json!({})))
}

async fn update_tc_params(
    State(hub): State<AppState>,
    Json(req): Json<UpdateTcParamsRequest>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.update_tc_params(req)).await?;
    Ok(Json(json!({})))
}

async fn update_tc_parent(
    State(hub): State<AppState>,
    Json(req): Json<UpdateTcParentRequest>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.update_tc_parent(req)).await?;
    Ok(Json(json!({})))
}

async fn reset_tcs(State(hub): State<AppState>) -> ControlResult<Json<Value>> {
    blocking(move || hub.reset_tcs()).await?;
    Ok(Json(json!({})))
}

async fn destroy_tc(
    State(hub): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.destroy_tc(&name)).await?;
    Ok(Json(json!({})))
}

async fn get_tc_stats(
    State(hub): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Value>> {
    Ok(Json(hub.get_tc_stats(&name)?))
}

async fn check_constraints(State(hub): State<AppState>) -> ControlResult<Json<Value>> {
    Ok(Json(hub.check_scheduling_constraints()?))
}

// ---------------------------------------------------------------- ports

async fn list_drivers(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.list_drivers())
}

async fn get_driver_info(
    State(hub): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Value>> {
    Ok(Json(hub.get_driver_info(&name)?))
}

async fn list_ports(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.list_ports())
}

#[derive(serde::Deserialize)]
struct CreatePortRequest {
    driver: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arg: Value,
}

async fn create_port(
    State(hub): State<AppState>,
    Json(req): Json<CreatePortRequest>,
) -> ControlResult<Json<Value>> {
    let out = blocking(move || hub.create_port(&req.driver, req.name, req.arg)).await?;
    Ok(Json(out))
}

async fn destroy_port(
    State(hub): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.destroy_port(&name)).await?;
    Ok(Json(json!({})))
}

async fn get_port_conf(
    State(hub): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Value>> {
    Ok(Json(hub.get_port_conf(&name)?))
}

async fn set_port_conf(
    State(hub): State<AppState>,
    Path(name): Path<String>,
    Json(conf): Json<PortConf>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.set_port_conf(&name, conf)).await?;
    Ok(Json(json!({})))
}

async fn get_port_stats(
    State(hub): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Value>> {
    Ok(Json(hub.get_port_stats(&name)?))
}

async fn get_link_status(
    State(hub): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Value>> {
    Ok(Json(hub.get_link_status(&name)?))
}

async fn reset_ports(State(hub): State<AppState>) -> ControlResult<Json<Value>> {
    blocking(move || hub.reset_ports()).await?;
    Ok(Json(json!({})))
}

// ---------------------------------------------------------------- modules

async fn list_mclasses(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.list_mclasses())
}

async fn get_mclass_info(
    State(hub): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Value>> {
    Ok(Json(hub.get_mclass_info(&name)?))
}

async fn list_modules(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.list_modules())
}

#[derive(serde::Deserialize)]
struct CreateModuleRequest {
    mclass: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arg: Value,
}

async fn create_module(
    State(hub): State<AppState>,
    Json(req): Json<CreateModuleRequest>,
) -> ControlResult<Json<Value>> {
    let out = blocking(move || hub.create_module(&req.mclass, req.name, req.arg)).await?;
    Ok(Json(out))
}

async fn destroy_module(
    State(hub): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.destroy_module(&name)).await?;
    Ok(Json(json!({})))
}

async fn get_module_info(
    State(hub): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Value>> {
    Ok(Json(hub.get_module_info(&name)?))
}

#[derive(serde::Deserialize)]
struct ConnectRequest {
    m1: String,
    ogate: u16,
    m2: String,
    igate: u16,
    #[serde(default)]
    skip_default_hooks: bool,
}

async fn connect_modules(
    State(hub): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> ControlResult<Json<Value>> {
    blocking(move || {
        hub.connect_modules(&req.m1, req.ogate, &req.m2, req.igate, req.skip_default_hooks)
    })
    .await?;
    Ok(Json(json!({})))
}

#[derive(serde::Deserialize)]
struct DisconnectRequest {
    m1: String,
    ogate: u16,
}

async fn disconnect_modules(
    State(hub): State<AppState>,
    Json(req): Json<DisconnectRequest>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.disconnect_modules(&req.m1, req.ogate)).await?;
    Ok(Json(json!({})))
}

async fn reset_modules(State(hub): State<AppState>) -> ControlResult<Json<Value>> {
    blocking(move || hub.reset_modules()).await?;
    Ok(Json(json!({})))
}

#[derive(serde::Deserialize)]
struct ModuleCommandRequest {
    cmd: String,
    #[serde(default)]
    arg: Value,
}

async fn module_command(
    State(hub): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ModuleCommandRequest>,
) -> ControlResult<Json<Value>> {
    let out = blocking(move || hub.module_command(&name, &req.cmd, &req.arg)).await?;
    Ok(Json(out))
}

// ---------------------------------------------------------------- hooks

async fn list_gatehooks(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.list_gatehooks())
}

async fn list_gatehook_classes(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.list_gatehook_classes())
}

async fn get_gatehook_class_info(
    State(hub): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Value>> {
    Ok(Json(hub.get_gatehook_class_info(&name)?))
}

async fn configure_gatehook(
    State(hub): State<AppState>,
    Json(req): Json<ConfigureGatehookRequest>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.configure_gatehook(req)).await?;
    Ok(Json(json!({})))
}

async fn gatehook_command(
    State(hub): State<AppState>,
    Json(req): Json<GatehookCommandRequest>,
) -> ControlResult<Json<Value>> {
    let out = blocking(move || hub.gatehook_command(req)).await?;
    Ok(Json(out))
}

#[derive(serde::Deserialize)]
struct ResumeHookRequest {
    name: String,
    enable: bool,
    #[serde(default)]
    arg: Value,
}

async fn configure_resume_hook(
    State(hub): State<AppState>,
    Json(req): Json<ResumeHookRequest>,
) -> ControlResult<Json<Value>> {
    blocking(move || hub.configure_resume_hook(&req.name, req.enable, &req.arg)).await?;
    Ok(Json(json!({})))
}

// ---------------------------------------------------------------- misc

async fn dump_mempool(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.dump_mempool())
}

async fn list_attributes(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.list_attributes())
}

#[derive(serde::Deserialize)]
struct PluginRequest {
    path: String,
}

async fn import_plugin(
    State(hub): State<AppState>,
    Json(req): Json<PluginRequest>,
) -> ControlResult<Json<Value>> {
    hub.import_plugin(&req.path)?;
    Ok(Json(json!({})))
}

async fn unload_plugin(
    State(hub): State<AppState>,
    Json(req): Json<PluginRequest>,
) -> ControlResult<Json<Value>> {
    hub.unload_plugin(&req.path)?;
    Ok(Json(json!({})))
}

async fn list_plugins(State(hub): State<AppState>) -> Json<Value> {
    Json(hub.list_plugins())
}
