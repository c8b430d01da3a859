//! Minimal stdio MCP server for demos and integration tests.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout. Flags make it
//! misbehave in controlled ways: hang or exit during the handshake, answer
//! slowly, crash mid-call, page its tool list, or print log noise on stdout.

use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};

use toolmux::mcp_client::types::{error_codes, PROTOCOL_VERSION};

#[derive(Parser, Debug, Clone)]
#[command(name = "toolmux-echo-server")]
#[command(about = "Stdio MCP server that echoes its arguments")]
struct Args {
    /// Server name reported in replies
    #[arg(long, default_value = "echo")]
    name: String,

    /// Tools to advertise (repeatable)
    #[arg(long = "tool", default_values = ["ping", "echo"])]
    tools: Vec<String>,

    /// Never answer `initialize`
    #[arg(long)]
    hang_on_init: bool,

    /// Exit with status 1 on `initialize`
    #[arg(long)]
    exit_on_init: bool,

    /// Tool whose reply is delayed by --call-delay-ms
    #[arg(long)]
    slow_tool: Option<String>,

    #[arg(long, default_value_t = 2000)]
    call_delay_ms: u64,

    /// Tool that makes the process exit without replying
    #[arg(long)]
    crash_tool: Option<String>,

    /// Tools per `tools/list` page (0 = everything at once)
    #[arg(long, default_value_t = 0)]
    page_size: usize,

    /// Answer `tools/list` with a method-not-found error
    #[arg(long)]
    fail_list: bool,

    /// Print non-JSON lines on stdout around replies
    #[arg(long)]
    noise: bool,
}

type Output = Arc<Mutex<io::Stdout>>;

fn main() {
    let args = Args::parse();
    let out: Output = Arc::new(Mutex::new(io::stdout()));
    let cancelled: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

    eprintln!("{} starting", args.name);
    if args.noise {
        write_raw(&out, &format!("{} v{} ready", args.name, env!("CARGO_PKG_VERSION")));
    }

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let Ok(message) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        let id = message.get("id").cloned().filter(|id| !id.is_null());
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match (method, id) {
            ("notifications/cancelled", None) => {
                if let Some(request) = params.get("requestId").and_then(Value::as_u64) {
                    lock(&cancelled).insert(request);
                }
            }
            (_, None) => {}
            ("initialize", Some(id)) => {
                if args.exit_on_init {
                    eprintln!("{}: refusing to initialize", args.name);
                    std::process::exit(1);
                }
                if args.hang_on_init {
                    continue;
                }
                reply(&out, &args, id, Ok(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": args.name, "version": env!("CARGO_PKG_VERSION")},
                })));
            }
            ("tools/list", Some(id)) => {
                let result = if args.fail_list {
                    Err((error_codes::METHOD_NOT_FOUND, "tools not supported".to_string()))
                } else {
                    Ok(list_tools(&args, &params))
                };
                reply(&out, &args, id, result);
            }
            ("tools/call", Some(id)) => {
                let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
                if args.crash_tool.as_deref() == Some(tool) {
                    eprintln!("{}: crashing on {tool}", args.name);
                    std::process::exit(3);
                }

                let result = call_tool(&args, tool, params.get("arguments"));
                if args.slow_tool.as_deref() == Some(tool) {
                    let (out, args, cancelled) = (Arc::clone(&out), args.clone(), Arc::clone(&cancelled));
                    std::thread::spawn(move || {
                        std::thread::sleep(Duration::from_millis(args.call_delay_ms));
                        let skip = id.as_u64().is_some_and(|n| lock(&cancelled).contains(&n));
                        if !skip {
                            reply(&out, &args, id, result);
                        }
                    });
                } else {
                    reply(&out, &args, id, result);
                }
            }
            ("ping", Some(id)) => reply(&out, &args, id, Ok(json!({}))),
            (other, Some(id)) => reply(
                &out,
                &args,
                id,
                Err((error_codes::METHOD_NOT_FOUND, format!("method not found: {other}"))),
            ),
        }
    }
}

fn list_tools(args: &Args, params: &Value) -> Value {
    let start: usize = params
        .get("cursor")
        .and_then(Value::as_str)
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let end = if args.page_size == 0 {
        args.tools.len()
    } else {
        (start + args.page_size).min(args.tools.len())
    };

    let tools: Vec<Value> = args.tools[start.min(end)..end]
        .iter()
        .map(|name| tool_definition(&args.name, name))
        .collect();

    let mut result = json!({ "tools": tools });
    if end < args.tools.len() {
        result["nextCursor"] = json!(end.to_string());
    }
    result
}

fn tool_definition(server: &str, tool: &str) -> Value {
    if tool == "ping" {
        json!({
            "name": "ping",
            "description": format!("Reply with pong from {server}"),
            "inputSchema": {"type": "object", "properties": {}},
        })
    } else {
        json!({
            "name": tool,
            "description": format!("Echo a message through {tool} on {server}"),
            "inputSchema": {
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"],
            },
        })
    }
}

fn call_tool(args: &Args, tool: &str, arguments: Option<&Value>) -> Result<Value, (i32, String)> {
    if !args.tools.iter().any(|t| t == tool) {
        return Err((error_codes::INVALID_PARAMS, format!("unknown tool: {tool}")));
    }

    if tool == "ping" {
        return Ok(text_result(&format!("pong from {}", args.name), false));
    }

    match arguments.and_then(|a| a.get("message")).and_then(Value::as_str) {
        Some(message) => Ok(text_result(&format!("{tool} from {}: {message}", args.name), false)),
        None => Ok(text_result("missing 'message' argument", true)),
    }
}

fn text_result(text: &str, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": is_error,
    })
}

fn reply(out: &Output, args: &Args, id: Value, result: Result<Value, (i32, String)>) {
    let message = match result {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    };
    if args.noise {
        write_raw(out, "[debug] sending reply");
    }
    write_raw(out, &message.to_string());
}

fn write_raw(out: &Output, line: &str) {
    let mut out = lock(out);
    // The client going away is the normal way to stop.
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
