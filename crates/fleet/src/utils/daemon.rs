use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};

use crate::config::{AppContext, compute_socket_path};
use crate::protocol::{C2D, C2DControl, D2C, D2CControl, read_frame, write_frame};

const DAEMON_NOT_RUNNING_MSG: &str =
  "Daemon not running. Please start it with `fleet daemon start`";

/// Connect to the daemon socket for the current context and bail with guidance on failure.
pub fn connect_daemon(ctx: &AppContext) -> Result<UnixStream> {
  let socket = compute_socket_path(&ctx.config);
  connect_daemon_socket(&socket)
}

/// Connect to a daemon socket path and bail with guidance on failure.
pub fn connect_daemon_socket(socket: &Path) -> Result<UnixStream> {
  UnixStream::connect(socket).map_err(|_| anyhow!(DAEMON_NOT_RUNNING_MSG))
}

/// Send one request over a short-lived connection and return the reply.
///
/// The daemon answers every one-shot request with exactly one frame and then
/// closes the socket. Error replies become `Err`.
pub fn request(ctx: &AppContext, msg: C2DControl) -> Result<D2CControl> {
  let mut stream = connect_daemon(ctx)?;
  request_on(&mut stream, msg)
}

pub fn request_on(stream: &mut UnixStream, msg: C2DControl) -> Result<D2CControl> {
  write_frame(&mut *stream, &C2D::Control(msg)).context("failed to write control frame")?;
  let D2C::Control(reply) = read_frame(&mut *stream).context("failed to read daemon reply")?;
  if let D2CControl::Error { message } = reply {
    bail!(message);
  }
  Ok(reply)
}

/// Reply of an unexpected kind; the daemon and CLI disagree about the protocol.
pub fn unexpected(reply: &D2CControl) -> anyhow::Error {
  anyhow!("unexpected daemon reply: {reply:?}")
}
