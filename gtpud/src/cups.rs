//! UECUPS control server: JSON commands over a stream socket.
//!
//! One JSON document per line. Each accepted client gets its own
//! session task with an outbound queue, so asynchronous indications
//! (subprocess terminations) interleave with command responses. All
//! sessions run on the control thread; registry mutation stays
//! confined there.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::{debug, info, warn};

use gtpud_proto::{CmdResult, CreateTun, DestroyTun, Response, ResultCode, StartProgram};

use crate::daemon::Daemon;
use crate::subprocess;
use crate::tunnel::{TunnelError, TunnelParams};

/// Accept loop. Runs until the listener fails.
pub async fn serve(daemon: Arc<Daemon>, listener: TcpListener) -> std::io::Result<()> {
    let mut next_session = 0u64;
    loop {
        let (stream, peer) = listener.accept().await?;
        next_session += 1;
        let session = next_session;
        info!(%peer, session, "Accepted new UECUPS connection");
        tokio::spawn(run_session(Arc::clone(&daemon), stream, peer, session));
    }
}

async fn run_session(daemon: Arc<Daemon>, stream: TcpStream, peer: SocketAddr, session: u64) {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();
    let (events_tx, mut events_rx) = unbounded_channel::<Value>();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    debug!(session, rx = %line, "JSON Rx");
                    if let Some(res) = handle_command(&daemon, session, &events_tx, &line)
                        && send_json(&mut wr, session, &res).await.is_err()
                    {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(session, error = %e, "Read error on control socket");
                    break;
                }
            },
            Some(msg) = events_rx.recv() => {
                if send_json(&mut wr, session, &msg).await.is_err() {
                    break;
                }
            }
        }
    }

    // Kill and forget every child this session launched.
    daemon.subprocesses.kill_session(session);
    info!(%peer, session, "UECUPS connection lost");
}

async fn send_json(wr: &mut OwnedWriteHalf, session: u64, msg: &Value) -> std::io::Result<()> {
    let mut out = msg.to_string();
    debug!(session, tx = %out, "JSON Tx");
    out.push('\n');
    wr.write_all(out.as_bytes()).await
}

/// Dispatch one framed JSON document; returns the immediate response,
/// if one is owed.
fn handle_command(
    daemon: &Arc<Daemon>,
    session: u64,
    events: &UnboundedSender<Value>,
    line: &str,
) -> Option<Value> {
    let doc: Value = match serde_json::from_str(line) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(session, error = %e, "Error decoding JSON");
            return None;
        }
    };
    let Some((key, args)) = doc.as_object().and_then(|obj| obj.iter().next()) else {
        warn!(session, "Command is not a single-key object");
        return None;
    };

    let response = match key.as_str() {
        "create_tun" => handle_create_tun(daemon, args),
        "destroy_tun" => handle_destroy_tun(daemon, args),
        "start_program" => handle_start_program(daemon, session, events, args),
        "reset_all_state" => handle_reset_all_state(daemon),
        other => {
            warn!(session, command = %other, "Unknown command received");
            result_res(other, ResultCode::InvalidData)
        }
    };
    Some(response)
}

fn handle_create_tun(daemon: &Arc<Daemon>, args: &Value) -> Value {
    let ctun: CreateTun = match serde_json::from_value(args.clone()) {
        Ok(ctun) => ctun,
        Err(e) => {
            warn!(error = %e, "Malformed create_tun command");
            return to_msg(Response::CreateTunRes(CmdResult {
                result: ResultCode::InvalidData,
            }));
        }
    };

    let params = match tunnel_params(&ctun) {
        Ok(params) => params,
        Err(e) => {
            warn!(error = %e, "Invalid address in create_tun command");
            return to_msg(Response::CreateTunRes(CmdResult {
                result: ResultCode::InvalidData,
            }));
        }
    };

    let result = match daemon.tunnel_create(&params) {
        Ok(()) => ResultCode::Ok,
        Err(TunnelError::Duplicate) => {
            warn!(rx_teid = params.rx_teid, "Rejecting duplicate tunnel");
            ResultCode::InvalidData
        }
        Err(e) => {
            warn!(error = %e, "Failed to allocate tunnel");
            ResultCode::NotFound
        }
    };
    to_msg(Response::CreateTunRes(CmdResult { result }))
}

fn handle_destroy_tun(daemon: &Arc<Daemon>, args: &Value) -> Value {
    let dtun: DestroyTun = match serde_json::from_value(args.clone()) {
        Ok(dtun) => dtun,
        Err(e) => {
            warn!(error = %e, "Malformed destroy_tun command");
            return to_msg(Response::DestroyTunRes(CmdResult {
                result: ResultCode::InvalidData,
            }));
        }
    };

    let result = match dtun.local_gtp_ep.to_socket_addr() {
        Ok(local) => match daemon.tunnel_destroy(&local, dtun.rx_teid) {
            Ok(()) => ResultCode::Ok,
            Err(e) => {
                warn!(error = %e, rx_teid = dtun.rx_teid, "Failed to destroy tunnel");
                ResultCode::NotFound
            }
        },
        Err(e) => {
            warn!(error = %e, "Invalid address in destroy_tun command");
            ResultCode::InvalidData
        }
    };
    to_msg(Response::DestroyTunRes(CmdResult { result }))
}

fn handle_start_program(
    daemon: &Arc<Daemon>,
    session: u64,
    events: &UnboundedSender<Value>,
    args: &Value,
) -> Value {
    let req: StartProgram = match serde_json::from_value(args.clone()) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "Malformed start_program command");
            return result_res("start_program", ResultCode::InvalidData);
        }
    };
    let res = subprocess::start_program(daemon, session, events.clone(), &req);
    to_msg(Response::StartProgramRes(res))
}

fn handle_reset_all_state(daemon: &Arc<Daemon>) -> Value {
    daemon.reset_tunnels();
    daemon.subprocesses.kill_all();
    to_msg(Response::ResetAllStateRes(CmdResult {
        result: ResultCode::Ok,
    }))
}

fn tunnel_params(ctun: &CreateTun) -> Result<TunnelParams, gtpud_proto::AddrError> {
    Ok(TunnelParams {
        local: ctun.local_gtp_ep.to_socket_addr()?,
        remote: ctun.remote_gtp_ep.to_socket_addr()?,
        rx_teid: ctun.rx_teid,
        tx_teid: ctun.tx_teid,
        user_addr: ctun.user_ip()?,
        tun_name: ctun.tun_dev_name.clone(),
        tun_netns: ctun.tun_netns_name.clone(),
    })
}

fn to_msg(res: Response) -> Value {
    serde_json::to_value(&res).expect("response serialization cannot fail")
}

/// `<cmd>_res` with a bare result code, for commands whose arguments
/// never parsed (including unknown command keys).
fn result_res(cmd: &str, result: ResultCode) -> Value {
    let mut res = serde_json::Map::new();
    res.insert(
        format!("{cmd}_res"),
        to_msg_result(CmdResult { result }),
    );
    Value::Object(res)
}

fn to_msg_result(res: CmdResult) -> Value {
    serde_json::to_value(&res).expect("result serialization cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_answers_invalid_data() {
        let res = result_res("frobnicate", ResultCode::InvalidData);
        assert_eq!(
            res.to_string(),
            r#"{"frobnicate_res":{"result":"ERR_INVALID_DATA"}}"#
        );
    }
}
