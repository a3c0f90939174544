use parking_lot::Mutex;

/// Start/stop state shared by the node and its peer managers. Each state is
/// entered at most once, so repeated start or stop calls are no-ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug)]
pub struct LifecycleCell {
    state: Mutex<Lifecycle>,
}

impl LifecycleCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn state(&self) -> Lifecycle {
        *self.state.lock()
    }

    /// `Idle -> Running`. False if already started or stopped.
    pub fn begin_start(&self) -> bool {
        let mut state = self.state.lock();
        if *state != Lifecycle::Idle {
            return false;
        }
        *state = Lifecycle::Running;
        true
    }

    /// Moves to `Stopped`. True only for the call that stops a running
    /// component; stopping an idle one just prevents a later start.
    pub fn begin_stop(&self) -> bool {
        let mut state = self.state.lock();
        let was_running = *state == Lifecycle::Running;
        *state = Lifecycle::Stopped;
        was_running
    }
}

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_happen_once() {
        let cell = LifecycleCell::new();
        assert!(cell.begin_start());
        assert!(!cell.begin_start());
        assert!(cell.begin_stop());
        assert!(!cell.begin_stop());
        assert!(!cell.begin_start());
        assert_eq!(cell.state(), Lifecycle::Stopped);
    }

    #[test]
    fn stopping_idle_blocks_later_start() {
        let cell = LifecycleCell::new();
        assert!(!cell.begin_stop());
        assert!(!cell.begin_start());
    }
}
