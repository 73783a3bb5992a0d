use std::io::{Read, Write};

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::broadcast::BroadcastPayload;
use crate::driver::Session;
use crate::events::SchedulerEvent;
use crate::messages::{DeliveryLogEntry, DeliveryResult, MessageSpec, ScheduledMessage};
use crate::monitor::ActivitySnapshot;
use crate::scheduler::{CheckInEntry, CheckInSpec};

/// Frames larger than this are rejected before allocating.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum C2DControl {
  Ping {
    nonce: u64,
  },
  /// Request the daemon version string
  GetVersion,
  /// Stop the daemon, optionally killing every managed session first
  Shutdown {
    kill_sessions: bool,
  },
  GetSnapshot,
  ListSessions,
  /// Keep the connection open and stream broadcasts and scheduler events
  Subscribe,
  CreateMessage {
    spec: MessageSpec,
  },
  UpdateMessage {
    id: String,
    spec: MessageSpec,
  },
  DeleteMessage {
    id: String,
  },
  ToggleMessage {
    id: String,
    is_active: bool,
  },
  RunMessageNow {
    id: String,
  },
  ListMessages,
  ListDeliveryLogs {
    limit: Option<u32>,
  },
  ClearDeliveryLogs,
  ScheduleCheckIn {
    spec: CheckInSpec,
  },
  CancelCheckIn {
    entity_id: String,
  },
  SetCheckInEnabled {
    entity_id: String,
    enabled: bool,
  },
  ListCheckIns,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum D2CControl {
  Pong {
    nonce: u64,
  },
  /// Reply with the running daemon version string
  Version {
    version: String,
  },
  Goodbye,
  Ack,
  Error {
    message: String,
  },
  Snapshot {
    snapshot: ActivitySnapshot,
  },
  Sessions {
    sessions: Vec<Session>,
  },
  Message {
    message: ScheduledMessage,
  },
  Messages {
    messages: Vec<ScheduledMessage>,
  },
  Delivery {
    result: DeliveryResult,
  },
  DeliveryLogs {
    entries: Vec<DeliveryLogEntry>,
  },
  Cleared {
    count: u64,
  },
  CheckIn {
    entry: CheckInEntry,
  },
  CheckIns {
    entries: Vec<CheckInEntry>,
  },
  /// Streamed to subscribers
  Broadcast {
    payload: BroadcastPayload,
  },
  /// Streamed to subscribers
  Event {
    event: SchedulerEvent,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum C2D {
  Control(C2DControl),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum D2C {
  Control(D2CControl),
}

pub fn write_frame<W: Write, T: Serialize>(mut w: W, msg: &T) -> Result<()> {
  let bytes = bincode::serde::encode_to_vec(msg, bincode::config::standard())
    .context("failed to encode frame")?;
  let len: u32 = bytes
    .len()
    .try_into()
    .map_err(|_| anyhow::anyhow!("frame too large"))?;
  w.write_all(&len.to_le_bytes())
    .context("failed to write len")?;
  w.write_all(&bytes).context("failed to write frame bytes")?;
  w.flush().context("failed to flush frame")?;
  Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(mut r: R) -> Result<T> {
  let mut len_buf = [0_u8; 4];
  r.read_exact(&mut len_buf).context("failed to read len")?;
  let len = u32::from_le_bytes(len_buf) as usize;
  if len > MAX_FRAME_LEN {
    bail!("frame of {len} bytes exceeds limit");
  }
  let mut data = vec![0_u8; len];
  r.read_exact(&mut data)
    .context("failed to read frame body")?;
  let (val, _): (T, usize) =
    bincode::serde::decode_from_slice(&data, bincode::config::standard()).context("decode error")?;
  Ok(val)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::messages::DelayUnit;
  use std::io::Cursor;

  #[test]
  fn frames_carry_nested_domain_types() -> Result<()> {
    let spec = MessageSpec {
      name: "nightly".into(),
      target_session: "core-alice".into(),
      target_project: Some("site".into()),
      message: "run the suite".into(),
      delay_amount: 3,
      delay_unit: DelayUnit::Hours,
      is_recurring: true,
      is_active: false,
    };
    let check_in = CheckInSpec::new("p1", "core-bob", 60).with_var("project", "site");
    let mut buf = Vec::new();
    write_frame(&mut buf, &C2D::Control(C2DControl::CreateMessage { spec: spec.clone() }))?;
    write_frame(&mut buf, &C2D::Control(C2DControl::ScheduleCheckIn { spec: check_in.clone() }))?;

    let mut cursor = Cursor::new(buf);
    let first: C2D = read_frame(&mut cursor)?;
    let second: C2D = read_frame(&mut cursor)?;
    assert_eq!(first, C2D::Control(C2DControl::CreateMessage { spec }));
    assert_eq!(second, C2D::Control(C2DControl::ScheduleCheckIn { spec: check_in }));
    Ok(())
  }

  #[test]
  fn snapshot_frame_survives_the_wire() -> Result<()> {
    let snapshot = ActivitySnapshot::empty();
    let mut buf = Vec::new();
    write_frame(
      &mut buf,
      &D2C::Control(D2CControl::Snapshot {
        snapshot: snapshot.clone(),
      }),
    )?;
    let back: D2C = read_frame(Cursor::new(buf))?;
    assert_eq!(back, D2C::Control(D2CControl::Snapshot { snapshot }));
    Ok(())
  }

  #[test]
  fn oversized_length_prefix_is_rejected() {
    let mut buf = u32::MAX.to_le_bytes().to_vec();
    buf.extend_from_slice(&[0; 8]);
    let err = read_frame::<_, C2D>(Cursor::new(buf)).unwrap_err();
    assert!(err.to_string().contains("exceeds limit"));
  }

  #[test]
  fn truncated_frame_is_an_error() {
    let mut buf = 10_u32.to_le_bytes().to_vec();
    buf.extend_from_slice(&[1, 2]);
    assert!(read_frame::<_, C2D>(Cursor::new(buf)).is_err());
  }
}
