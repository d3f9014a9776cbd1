/// Lifecycle of a query controller.
///
/// ```text
/// Initial --LocalLoaded--> Loaded --RefreshStarted--> Refreshing
///                            ^  \                         |
///                            |   `--LoadMoreStarted--.    | RefreshFinished
///                            |                       v    |
///                            `--LoadMoreFinished-- LoadingCursor
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
  /// Nothing loaded yet.
  Initial,
  /// Rows reflect the local store; idle.
  Loaded,
  /// A fresh remote query is in flight.
  Refreshing,
  /// A continuation page is in flight.
  LoadingCursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  LocalLoaded,
  RefreshStarted,
  RefreshFinished,
  LoadMoreStarted,
  LoadMoreFinished,
}

impl ControllerState {
  /// The state reached by `transition`, or `None` when the transition is not
  /// allowed from here.
  pub fn apply(self, transition: Transition) -> Option<ControllerState> {
    use ControllerState::*;
    use Transition::*;

    match (self, transition) {
      (Initial, LocalLoaded) => Some(Loaded),
      (Loaded, RefreshStarted) => Some(Refreshing),
      (Refreshing, RefreshFinished) => Some(Loaded),
      (Loaded, LoadMoreStarted) => Some(LoadingCursor),
      (LoadingCursor, LoadMoreFinished) => Some(Loaded),
      _ => None,
    }
  }

  /// Whether store notifications are applied to the rows immediately.
  /// Otherwise they are held until the controller is back in `Loaded`.
  pub fn applies_live_changes(self) -> bool {
    matches!(self, ControllerState::Loaded | ControllerState::Refreshing)
  }
}
