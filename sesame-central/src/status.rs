//! Device status reported to the host application

use std::fmt;

use sesame_proto::{ItemCode, LockState, ResultCode};

/// Status of the lock as seen by the controller
///
/// Ordered: everything from `LoggingIn` up accepts authenticated commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceStatus {
    Disconnected,
    Scanning,
    Connecting,
    /// GATT ready, registration in progress
    Connected,
    /// Device secret derived, login sent
    LoggingIn,
    LoggedIn,
    Locked,
    Unlocked,
    /// Bolt is neither in the lock nor the unlock range
    Moved,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Scanning => "scanning",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Connected => "connected",
            DeviceStatus::LoggingIn => "logging_in",
            DeviceStatus::LoggedIn => "logged_in",
            DeviceStatus::Locked => "locked",
            DeviceStatus::Unlocked => "unlocked",
            DeviceStatus::Moved => "moved",
        }
    }

    pub fn is_authenticated(&self) -> bool {
        *self >= DeviceStatus::LoggedIn
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LockState> for DeviceStatus {
    fn from(state: LockState) -> Self {
        match state {
            LockState::Locked => DeviceStatus::Locked,
            LockState::Unlocked => DeviceStatus::Unlocked,
            LockState::Moved => DeviceStatus::Moved,
        }
    }
}

/// Command the host application can ask for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    /// `None` uses the controller's default history tag
    Lock { tag: Option<Vec<u8>> },
    Unlock { tag: Option<Vec<u8>> },
    ReadHistory,
}

/// Application callback
///
/// `on_status` runs once per status change. A returned command is issued
/// right away, inside the same event dispatch.
pub trait StatusObserver {
    fn on_status(&mut self, status: DeviceStatus) -> Option<AppCommand>;

    /// The lock answered an authenticated command
    fn on_response(&mut self, _item_code: ItemCode, _result: ResultCode) {}
}

impl<F> StatusObserver for F
where
    F: FnMut(DeviceStatus) -> Option<AppCommand>,
{
    fn on_status(&mut self, status: DeviceStatus) -> Option<AppCommand> {
        self(status)
    }
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct Quiet;

impl StatusObserver for Quiet {
    fn on_status(&mut self, _status: DeviceStatus) -> Option<AppCommand> {
        None
    }
}

/// Locks the door again whenever it reports unlocked
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoLock;

impl StatusObserver for AutoLock {
    fn on_status(&mut self, status: DeviceStatus) -> Option<AppCommand> {
        (status == DeviceStatus::Unlocked).then_some(AppCommand::Lock { tag: None })
    }
}

/// Issues one command as soon as the session is logged in and remembers the answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneShot {
    command: Option<AppCommand>,
    item_code: ItemCode,
    result: Option<ResultCode>,
}

impl OneShot {
    pub fn new(command: AppCommand) -> Self {
        let item_code = match &command {
            AppCommand::Lock { .. } => ItemCode::LOCK,
            AppCommand::Unlock { .. } => ItemCode::UNLOCK,
            AppCommand::ReadHistory => ItemCode::HISTORY,
        };
        Self {
            command: Some(command),
            item_code,
            result: None,
        }
    }

    /// Answer of the lock, once it arrived
    pub fn result(&self) -> Option<ResultCode> {
        self.result
    }

    pub fn is_done(&self) -> bool {
        self.result.is_some()
    }
}

impl StatusObserver for OneShot {
    fn on_status(&mut self, status: DeviceStatus) -> Option<AppCommand> {
        if status == DeviceStatus::LoggedIn {
            self.command.take()
        } else {
            None
        }
    }

    fn on_response(&mut self, item_code: ItemCode, result: ResultCode) {
        if item_code == self.item_code {
            self.result = Some(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_fires_once_and_waits_for_its_answer() {
        let mut observer = OneShot::new(AppCommand::ReadHistory);
        assert_eq!(observer.on_status(DeviceStatus::Connected), None);
        assert_eq!(
            observer.on_status(DeviceStatus::LoggedIn),
            Some(AppCommand::ReadHistory)
        );
        assert_eq!(observer.on_status(DeviceStatus::LoggedIn), None);

        observer.on_response(ItemCode::LOCK, ResultCode::SUCCESS);
        assert!(!observer.is_done());
        observer.on_response(ItemCode::HISTORY, ResultCode::NOT_FOUND);
        assert_eq!(observer.result(), Some(ResultCode::NOT_FOUND));
    }

    #[test]
    fn ordering_matches_handshake_progress() {
        assert!(DeviceStatus::Scanning < DeviceStatus::Connecting);
        assert!(DeviceStatus::LoggingIn < DeviceStatus::LoggedIn);
        assert!(DeviceStatus::Unlocked.is_authenticated());
        assert!(!DeviceStatus::LoggingIn.is_authenticated());
    }

    #[test]
    fn auto_lock_only_reacts_to_unlocked() {
        let mut observer = AutoLock;
        assert_eq!(observer.on_status(DeviceStatus::Locked), None);
        assert_eq!(
            observer.on_status(DeviceStatus::Unlocked),
            Some(AppCommand::Lock { tag: None })
        );
    }

    #[test]
    fn closures_are_observers() {
        let mut seen = Vec::new();
        {
            let mut observer = |status: DeviceStatus| -> Option<AppCommand> {
                seen.push(status);
                None
            };
            observer.on_status(DeviceStatus::Scanning);
            observer.on_status(DeviceStatus::Connecting);
        }
        assert_eq!(seen, vec![DeviceStatus::Scanning, DeviceStatus::Connecting]);
    }
}
