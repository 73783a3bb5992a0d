mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet::Fleet;
use fleet::driver::MemoryDriver;
use fleet::events::EventKind;
use fleet::monitor::ActivityState;
use fleet::scheduler::CheckInSpec;
use parking_lot::Mutex;

use crate::common::{Recorder, context, message, temp_project, wait_until};

#[test]
fn recurring_message_delivers_and_advances() -> Result<()> {
  let dir = temp_project();
  let driver = Arc::new(MemoryDriver::new());
  driver.add_session("core-alice");
  let fleet = Fleet::new(driver.clone(), &context(dir.path()))?;
  fleet.start()?;

  let created = fleet.create_scheduled_message(message("standup", "core-alice", 1, true))?;
  let first_next = created.next_run.expect("active message has a next run");

  assert!(wait_until(Duration::from_secs(4), || {
    !fleet.list_delivery_logs(None).is_empty()
  }));
  let log = fleet.list_delivery_logs(None);
  assert!(log[0].success);
  assert_eq!(log[0].scheduled_message_id, created.id);
  assert_eq!(driver.submitted("core-alice"), vec!["standup: status?".to_string()]);

  let after = fleet.get_scheduled_message(&created.id)?;
  let last_run = after.last_run.expect("fired message has a last run");
  let next = after.next_run.expect("recurring message stays scheduled");
  assert!(after.is_active);
  assert!(next > first_next);
  assert_eq!(next - last_run, chrono::Duration::seconds(1));
  fleet.shutdown(false)?;
  Ok(())
}

#[test]
fn one_shot_to_missing_session_fails_and_deactivates() -> Result<()> {
  let dir = temp_project();
  let driver = Arc::new(MemoryDriver::new());
  let fleet = Fleet::new(driver, &context(dir.path()))?;
  let delivered = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&delivered);
  fleet.events().subscribe(move |event| {
    if event.kind == EventKind::MessageDelivered {
      sink.lock().push(event.success);
    }
    Ok(())
  });
  fleet.start()?;

  let created = fleet.create_scheduled_message(message("ping", "ghost", 1, false))?;
  assert!(wait_until(Duration::from_secs(4), || {
    !fleet.list_delivery_logs(None).is_empty()
  }));

  let log = fleet.list_delivery_logs(None);
  assert_eq!(log.len(), 1);
  assert!(!log[0].success);
  assert!(log[0].error.is_some());
  let after = fleet.get_scheduled_message(&created.id)?;
  assert!(!after.is_active);
  assert!(after.next_run.is_none());
  assert!(wait_until(Duration::from_secs(1), || !delivered.lock().is_empty()));
  assert_eq!(*delivered.lock(), vec![false]);
  fleet.shutdown(false)?;
  Ok(())
}

#[test]
fn rescheduled_check_in_fires_once_at_new_interval() -> Result<()> {
  let dir = temp_project();
  let driver = Arc::new(MemoryDriver::new());
  driver.add_session("core-bob");
  let fleet = Fleet::new(driver.clone(), &context(dir.path()))?;

  fleet.schedule_check_in(CheckInSpec::new("p1", "core-bob", 1).with_template("old {entity_id}"))?;
  std::thread::sleep(Duration::from_millis(300));
  fleet.schedule_check_in(CheckInSpec::new("p1", "core-bob", 2).with_template("new {entity_id}"))?;

  // The first timer would have fired by now.
  std::thread::sleep(Duration::from_millis(1200));
  assert!(driver.submitted("core-bob").is_empty());

  assert!(wait_until(Duration::from_secs(2), || {
    !driver.submitted("core-bob").is_empty()
  }));
  std::thread::sleep(Duration::from_millis(300));
  assert_eq!(driver.submitted("core-bob"), vec!["new p1".to_string()]);
  assert_eq!(fleet.list_check_ins().len(), 1);
  fleet.shutdown(false)?;
  Ok(())
}

#[test]
fn registry_burst_yields_one_broadcast() -> Result<()> {
  let dir = temp_project();
  let ctx = context(dir.path());
  let registry_path = ctx.paths.registry_file(&ctx.config);
  std::fs::create_dir_all(registry_path.parent().expect("registry has a parent"))?;
  std::fs::write(
    &registry_path,
    r#"{"teams":[{"id":"core","name":"Core","members":[{"id":"m1","name":"Alice","sessionName":"core-alice"}]}]}"#,
  )?;

  let driver = Arc::new(MemoryDriver::new());
  driver.add_session("core-alice");
  driver.set_pane("core-alice", "done\n> ");
  let fleet = Fleet::new(driver, &ctx)?;
  let recorder = Recorder::new();
  fleet.set_broadcast_sink(Some(recorder.clone()));
  fleet.start()?;

  assert!(wait_until(Duration::from_secs(3), || {
    recorder
      .payloads()
      .last()
      .is_some_and(|p| p.members.iter().any(|m| m.state == ActivityState::Idle))
  }));
  // Let any trailing monitor updates settle.
  std::thread::sleep(Duration::from_millis(300));
  let before = recorder.len();

  for name in ["Alicia", "Ali", "Alice B."] {
    std::fs::write(
      &registry_path,
      format!(
        r#"{{"teams":[{{"id":"core","name":"Core","members":[{{"id":"m1","name":"{name}","sessionName":"core-alice"}}]}}]}}"#
      ),
    )?;
    std::thread::sleep(Duration::from_millis(80));
  }
  std::thread::sleep(Duration::from_millis(800));

  let payloads = recorder.payloads();
  assert_eq!(payloads.len(), before + 1);
  let last = payloads.last().expect("one broadcast");
  assert_eq!(last.members[0].name.as_deref(), Some("Alice B."));
  fleet.shutdown(false)?;
  Ok(())
}
