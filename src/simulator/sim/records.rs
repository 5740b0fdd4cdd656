//! Events the core models leave behind for the run report.

use std::fmt;

/// What a core did, roughly in the order a block moves through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreAction {
  Launch,
  /// Receiver reserved its slot and bumped the sender's semaphore.
  ReceiverReady,
  McastSend,
  McastRecv,
  SemSet,
  SemInc,
  /// Operand block handed to compute.
  PushBlock,
  /// Output block handed to the writer.
  PackBlock,
  Done,
}

impl CoreAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      CoreAction::Launch => "launch",
      CoreAction::ReceiverReady => "receiver_ready",
      CoreAction::McastSend => "mcast_send",
      CoreAction::McastRecv => "mcast_recv",
      CoreAction::SemSet => "sem_set",
      CoreAction::SemInc => "sem_inc",
      CoreAction::PushBlock => "push_block",
      CoreAction::PackBlock => "pack_block",
      CoreAction::Done => "done",
    }
  }
}

impl fmt::Display for CoreAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Push a `CoreAction` record stamped with the current simulation time.
///
/// ```ignore
/// core_record!(self, services, CoreAction::McastRecv, format!("{} step={}", axis, step));
/// ```
#[macro_export]
macro_rules! core_record {
  ($self:expr, $services:expr, $action:expr, $subject:expr) => {
    $self.records.push(sim::models::ModelRecord {
      time: $services.global_time(),
      action: $crate::simulator::sim::records::CoreAction::as_str(&$action).to_string(),
      subject: $subject.to_string(),
    });
  };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn record_names_are_snake_case_and_distinct() {
    let all = [
      CoreAction::Launch,
      CoreAction::ReceiverReady,
      CoreAction::McastSend,
      CoreAction::McastRecv,
      CoreAction::SemSet,
      CoreAction::SemInc,
      CoreAction::PushBlock,
      CoreAction::PackBlock,
      CoreAction::Done,
    ];
    let names: std::collections::HashSet<&str> = all.iter().map(CoreAction::as_str).collect();
    assert_eq!(names.len(), all.len());
    assert_eq!(CoreAction::ReceiverReady.to_string(), "receiver_ready");
    assert!(names.iter().all(|n| n.chars().all(|c| c.is_ascii_lowercase() || c == '_')));
  }
}
