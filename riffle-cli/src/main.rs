//! riffle-cli: drive a running riffled over its HTTP control API.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use reqwest::Client;
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "riffle-cli")]
#[command(about = "Control client for the riffled dataplane daemon")]
struct Args {
    /// Daemon control endpoint
    #[arg(long, default_value = "http://127.0.0.1:10514", env = "RIFFLE_ENDPOINT")]
    endpoint: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Daemon version and counters
    Status,
    /// Pause every worker
    Pause,
    /// Resume every worker (attaches pending orphan classes)
    Resume,
    /// Destroy all modules, ports and traffic classes
    ResetAll,
    /// Shut the daemon down
    Kill,
    /// List workers
    Workers,
    /// Launch a worker pinned to a core
    AddWorker {
        wid: usize,
        core: usize,
        #[arg(long, default_value = "default")]
        scheduler: String,
    },
    /// Destroy a worker (must have no traffic classes)
    DestroyWorker { wid: usize },
    /// List modules
    Modules,
    /// Show one module in detail
    Module { name: String },
    /// List module classes
    Mclasses,
    /// Create a module; ARG is a JSON object
    CreateModule {
        mclass: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "{}")]
        arg: String,
    },
    /// Destroy a module
    DestroyModule { name: String },
    /// Connect m1:ogate -> m2:igate
    Connect {
        m1: String,
        ogate: u16,
        m2: String,
        igate: u16,
        #[arg(long)]
        skip_default_hooks: bool,
    },
    /// Tear down m1:ogate
    Disconnect { m1: String, ogate: u16 },
    /// Run a module command; ARG is a JSON object
    Command {
        module: String,
        cmd: String,
        #[arg(long, default_value = "{}")]
        arg: String,
    },
    /// List traffic classes
    Tcs,
    /// Create a traffic class
    AddTc {
        name: String,
        policy: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        wid: Option<i64>,
        #[arg(long)]
        resource: Option<String>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        max_burst: Option<u64>,
        #[arg(long)]
        priority: Option<u32>,
        #[arg(long)]
        share: Option<u32>,
    },
    /// Stats for one traffic class
    TcStats { name: String },
    /// Placement constraint report
    Constraints,
    /// List ports
    Ports,
    /// Create a port; ARG is a JSON object
    CreatePort {
        driver: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "{}")]
        arg: String,
    },
    /// Destroy a port
    DestroyPort { name: String },
    /// Per-queue port statistics
    PortStats { name: String },
    /// Packet pool occupancy
    Mempool,
}

fn parse_json_arg(raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid JSON argument: {raw}"))
}

async fn get(client: &Client, endpoint: &str, path: &str) -> anyhow::Result<Value> {
    let resp = client.get(format!("{endpoint}{path}")).send().await?;
    decode(resp).await
}

async fn post(client: &Client, endpoint: &str, path: &str, body: Value) -> anyhow::Result<Value> {
    let resp = client
        .post(format!("{endpoint}{path}"))
        .json(&body)
        .send()
        .await?;
    decode(resp).await
}

async fn delete(client: &Client, endpoint: &str, path: &str) -> anyhow::Result<Value> {
    let resp = client.delete(format!("{endpoint}{path}")).send().await?;
    decode(resp).await
}

async fn decode(resp: reqwest::Response) -> anyhow::Result<Value> {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        anyhow::bail!("{}: {}", status.as_u16().to_string().red(), message);
    }
    Ok(body)
}

fn dump(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = Client::new();
    let ep = args.endpoint.trim_end_matches('/').to_string();

    match args.command {
        Command::Status => {
            let v = get(&client, &ep, "/status").await?;
            println!(
                "{} v{} up {}s",
                "riffled".green().bold(),
                v["version"].as_str().unwrap_or("?"),
                v["uptime_s"]
            );
            println!(
                "  workers={} modules={} ports={} orphan_tcs={}",
                v["workers"], v["modules"], v["ports"], v["orphan_tcs"]
            );
            println!(
                "  control_ops={} pauses={} resumes={} graph_updates={}",
                v["control_ops"], v["pauses"], v["resumes"], v["graph_updates"]
            );
        }
        Command::Pause => {
            post(&client, &ep, "/pause_all", json!({})).await?;
            println!("{}", "paused".yellow());
        }
        Command::Resume => {
            post(&client, &ep, "/resume_all", json!({})).await?;
            println!("{}", "running".green());
        }
        Command::ResetAll => {
            post(&client, &ep, "/reset_all", json!({})).await?;
            println!("reset");
        }
        Command::Kill => {
            post(&client, &ep, "/kill", json!({})).await?;
            println!("daemon shutting down");
        }
        Command::Workers => {
            let v = get(&client, &ep, "/workers").await?;
            for w in v["workers"].as_array().into_iter().flatten() {
                println!(
                    "worker {} core={} socket={} status={} tcs={}",
                    w["wid"], w["core"], w["socket"], w["status"], w["num_tcs"]
                );
            }
        }
        Command::AddWorker {
            wid,
            core,
            scheduler,
        } => {
            post(
                &client,
                &ep,
                "/workers",
                json!({ "wid": wid, "core": core, "scheduler": scheduler }),
            )
            .await?;
            println!("worker {wid} on core {core}");
        }
        Command::DestroyWorker { wid } => {
            delete(&client, &ep, &format!("/workers/{wid}")).await?;
            println!("worker {wid} destroyed");
        }
        Command::Modules => {
            let v = get(&client, &ep, "/modules").await?;
            for m in v["modules"].as_array().into_iter().flatten() {
                println!(
                    "{} ({}) {} deadends={}",
                    m["name"].as_str().unwrap_or("?").bold(),
                    m["mclass"].as_str().unwrap_or("?"),
                    m["desc"].as_str().unwrap_or(""),
                    m["deadends"]
                );
            }
        }
        Command::Module { name } => {
            dump(&get(&client, &ep, &format!("/modules/{name}")).await?);
        }
        Command::Mclasses => {
            dump(&get(&client, &ep, "/mclasses").await?);
        }
        Command::CreateModule { mclass, name, arg } => {
            let v = post(
                &client,
                &ep,
                "/modules",
                json!({ "mclass": mclass, "name": name, "arg": parse_json_arg(&arg)? }),
            )
            .await?;
            println!("created {}", v["name"].as_str().unwrap_or("?").bold());
        }
        Command::DestroyModule { name } => {
            delete(&client, &ep, &format!("/modules/{name}")).await?;
            println!("destroyed {name}");
        }
        Command::Connect {
            m1,
            ogate,
            m2,
            igate,
            skip_default_hooks,
        } => {
            post(
                &client,
                &ep,
                "/modules/connect",
                json!({
                    "m1": m1, "ogate": ogate, "m2": m2, "igate": igate,
                    "skip_default_hooks": skip_default_hooks,
                }),
            )
            .await?;
            println!("{m1}:{ogate} -> {m2}:{igate}");
        }
        Command::Disconnect { m1, ogate } => {
            post(
                &client,
                &ep,
                "/modules/disconnect",
                json!({ "m1": m1, "ogate": ogate }),
            )
            .await?;
            println!("{m1}:{ogate} disconnected");
        }
        Command::Command { module, cmd, arg } => {
            let v = post(
                &client,
                &ep,
                &format!("/modules/{module}/command"),
                json!({ "cmd": cmd, "arg": parse_json_arg(&arg)? }),
            )
            .await?;
            dump(&v);
        }
        Command::Tcs => {
            let v = get(&client, &ep, "/tcs").await?;
            for c in v["classes"].as_array().into_iter().flatten() {
                let blocked = match c["blocked"] {
                    Value::Bool(true) => "blocked".red().to_string(),
                    Value::Bool(false) => "runnable".green().to_string(),
                    _ => "orphan".yellow().to_string(),
                };
                println!(
                    "{} policy={} wid={} parent={} {}",
                    c["name"].as_str().unwrap_or("?").bold(),
                    c["policy"], c["wid"], c["parent"], blocked
                );
            }
        }
        Command::AddTc {
            name,
            policy,
            parent,
            wid,
            resource,
            limit,
            max_burst,
            priority,
            share,
        } => {
            post(
                &client,
                &ep,
                "/tcs",
                json!({
                    "name": name, "policy": policy, "parent": parent, "wid": wid,
                    "resource": resource, "limit": limit, "max_burst": max_burst,
                    "priority": priority, "share": share,
                }),
            )
            .await?;
            println!("tc {name} added");
        }
        Command::TcStats { name } => {
            dump(&get(&client, &ep, &format!("/tcs/{name}/stats")).await?);
        }
        Command::Constraints => {
            let v = get(&client, &ep, "/constraints").await?;
            if v["violations"].as_array().map(Vec::len).unwrap_or(0) == 0 {
                println!("{}", "no violations".green());
            } else {
                dump(&v);
            }
        }
        Command::Ports => {
            dump(&get(&client, &ep, "/ports").await?);
        }
        Command::CreatePort { driver, name, arg } => {
            let v = post(
                &client,
                &ep,
                "/ports",
                json!({ "driver": driver, "name": name, "arg": parse_json_arg(&arg)? }),
            )
            .await?;
            println!("created {}", v["name"].as_str().unwrap_or("?").bold());
        }
        Command::DestroyPort { name } => {
            delete(&client, &ep, &format!("/ports/{name}")).await?;
            println!("destroyed {name}");
        }
        Command::PortStats { name } => {
            dump(&get(&client, &ep, &format!("/ports/{name}/stats")).await?);
        }
        Command::Mempool => {
            dump(&get(&client, &ep, "/mempools").await?);
        }
    }
    Ok(())
}
