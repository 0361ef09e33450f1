mod auth;
mod config;
mod connection;
mod controller;
mod layout;
mod protocol;
mod session;
mod transport;
mod tree;
mod types;

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, TryRecvError};
use std::thread;
use std::time::Duration;

use auth::ConfigTokenProvider;
use config::Config;
use connection::ConnectionManager;
use controller::PaneController;
use layout::LayoutStore;
use session::SessionProtocol;
use transport::{Transport, WsTransport};
use types::{LayoutKind, VERSION};

fn print_usage() {
    println!("usage: wsmux [--server URL] [--session ID] [--user NAME] [--no-connect]");
    println!();
    println!("commands (stdin): split-h split-v tab close-tab close-pane next prev");
    println!("                  resize N select-tab N rename NAME send TEXT");
    println!("                  winsize ROWS COLS layout status reconnect detach quit");
}

fn main() {
    env_logger::init();

    let mut server: Option<String> = None;
    let mut session = "default".to_string();
    let mut user = whoami();
    let mut auto_connect = true;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--server" | "-s" => {
                if let Some(v) = args.next() { server = Some(v); }
            }
            "--session" => {
                if let Some(v) = args.next() { session = v; }
            }
            "--user" | "-u" => {
                if let Some(v) = args.next() { user = v; }
            }
            "--no-connect" => auto_connect = false,
            "-V" | "--version" => {
                println!("wsmux {}", VERSION);
                return;
            }
            "-h" | "--help" => {
                print_usage();
                return;
            }
            other => {
                eprintln!("wsmux: unknown argument '{}'", other);
                print_usage();
                std::process::exit(2);
            }
        }
    }

    let mut cfg = Config::load();
    if let Some(url) = server {
        cfg.server_url = url;
    }
    if let Err(e) = cfg.validate_server_url() {
        eprintln!("wsmux: {}", e);
        std::process::exit(2);
    }

    let transport = WsTransport::new(cfg.server_url.clone(), cfg.reconnect.clone());
    let manager = ConnectionManager::new(transport);
    let tokens = Box::new(ConfigTokenProvider::new(cfg.auth_token.clone()));
    let protocol = SessionProtocol::new(manager, tokens);
    let mut client = PaneController::new(protocol, LayoutStore::new(cfg.default_shell.clone()));

    let status_token = client.on_state_change(|state| {
        if state.reconnecting {
            eprintln!("wsmux: reconnecting (attempt {})...", state.reconnect_attempt);
        } else if !state.connected {
            if let Some(err) = &state.error {
                eprintln!("wsmux: disconnected: {} (type 'reconnect' to retry)", err);
            }
        }
    });

    if auto_connect {
        client.connect();
    }
    client.open_session(&session, &user, None);

    // Dedicated stdin reader so the pump loop never blocks on input.
    let (line_tx, line_rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut stdout = io::stdout();
    loop {
        client.pump();
        if let Some((_, tab)) = client.layouts().active_tab(&session) {
            let out = client.take_output(&session, tab);
            if !out.is_empty() {
                let _ = stdout.write_all(&out);
                let _ = stdout.flush();
            }
        }
        match line_rx.try_recv() {
            Ok(line) => {
                if !handle_command(&mut client, &session, &line) {
                    break;
                }
            }
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(20)),
            Err(TryRecvError::Disconnected) => break,
        }
    }

    client.leave_session(&session, &user);
    client.unsubscribe(status_token);
    client.disconnect();
}

/// Dispatch one driver command. Returns false to quit.
fn handle_command<T: Transport>(client: &mut PaneController<T>, session: &str, line: &str) -> bool {
    let mut parts = line.trim().splitn(2, char::is_whitespace);
    let (Some(cmd), rest) = (parts.next(), parts.next().unwrap_or("").trim()) else { return true };
    let active_pane = client.layouts().active_pane(session);
    match cmd {
        "" => {}
        "split-h" => {
            if let Some(pane) = active_pane {
                let _ = client.split(session, pane, LayoutKind::Horizontal);
            }
        }
        "split-v" => {
            if let Some(pane) = active_pane {
                let _ = client.split(session, pane, LayoutKind::Vertical);
            }
        }
        "tab" => {
            if let Some(pane) = active_pane {
                let _ = client.add_tab(session, pane);
            }
        }
        "close-tab" => {
            if let Some((pane, tab)) = client.layouts().active_tab(session) {
                client.close_tab(session, pane, tab);
            }
        }
        "close-pane" => {
            if let Some(pane) = active_pane {
                client.close_pane(session, pane);
            }
        }
        "next" => client.focus_next_pane(session),
        "prev" => client.focus_prev_pane(session),
        "resize" => {
            if let (Some(pane), Ok(size)) = (active_pane, rest.parse::<i32>()) {
                client.resize_pane(session, pane, size);
            }
        }
        "select-tab" => {
            if let (Some(pane), Ok(tab)) = (active_pane, rest.parse::<usize>()) {
                client.select_tab(session, pane, tab);
            }
        }
        "rename" => {
            if let Some((pane, tab)) = client.layouts().active_tab(session) {
                if !rest.is_empty() {
                    client.rename_tab(session, pane, tab, rest);
                }
            }
        }
        "send" => {
            client.send_input(session, &format!("{}\n", rest));
        }
        "winsize" => {
            let mut dims = rest.split_whitespace();
            if let (Some(Ok(rows)), Some(Ok(cols))) = (dims.next().map(str::parse), dims.next().map(str::parse)) {
                client.resize_terminal(session, rows, cols);
            }
        }
        "layout" => {
            if let Some(json) = client.layouts().layout_json(session) {
                println!("{}", json);
            }
        }
        "status" => {
            println!("{}", client.status_line());
            if let Some(att) = client.active_attachment() {
                println!("joined {} as {}", att.session_id, att.user_id);
            }
            if let Some(root) = client.layouts().layout(session) {
                println!("{} panes, {} tabs", tree::count_panes(root), tree::count_tabs(root));
            }
        }
        "connect" => client.connect(),
        "reconnect" => client.reconnect(),
        "detach" => client.disconnect(),
        "quit" | "exit" => {
            return false;
        }
        other => {
            eprintln!("wsmux: unknown command '{}'", other);
        }
    }
    true
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_string())
}
