//! In-flight command and response slots, indexed by CID.

use std::sync::Arc;

use super::command::{Command, Response};

/// Two parallel slot tables. A submission fills both slots of its CID; the
/// send completion clears the command slot and the response completion
/// clears the response slot, in either order.
#[derive(Debug)]
pub(crate) struct Registry {
    commands: Vec<Option<Arc<Command>>>,
    responses: Vec<Option<Arc<Response>>>,
}

impl Registry {
    pub(crate) fn new(depth: u16) -> Self {
        Self {
            commands: vec![None; usize::from(depth)],
            responses: vec![None; usize::from(depth)],
        }
    }

    pub(crate) fn has_command(&self, cid: u16) -> bool {
        matches!(self.commands.get(usize::from(cid)), Some(Some(_)))
    }

    #[cfg(test)]
    pub(crate) fn has_response(&self, cid: u16) -> bool {
        matches!(self.responses.get(usize::from(cid)), Some(Some(_)))
    }

    /// Fill both slots for a freshly allocated CID.
    pub(crate) fn insert(&mut self, cid: u16, command: Arc<Command>, response: Arc<Response>) {
        let idx = usize::from(cid);
        debug_assert!(self.commands[idx].is_none());
        debug_assert!(self.responses[idx].is_none());
        self.commands[idx] = Some(command);
        self.responses[idx] = Some(response);
    }

    /// Clear both slots, as when a post fails before reaching the wire.
    pub(crate) fn remove(&mut self, cid: u16) {
        let idx = usize::from(cid);
        if idx < self.commands.len() {
            self.commands[idx] = None;
            self.responses[idx] = None;
        }
    }

    pub(crate) fn take_command(&mut self, cid: u16) -> Option<Arc<Command>> {
        self.commands.get_mut(usize::from(cid))?.take()
    }

    pub(crate) fn take_response(&mut self, cid: u16) -> Option<Arc<Response>> {
        self.responses.get_mut(usize::from(cid))?.take()
    }

    /// Every populated response slot. The slots stay populated.
    pub(crate) fn pending_responses(&self) -> Vec<Arc<Response>> {
        self.responses.iter().flatten().cloned().collect()
    }

    /// CIDs with a populated command or response slot, ascending.
    pub(crate) fn in_flight(&self) -> Vec<u16> {
        (0..self.commands.len())
            .filter(|&i| self.commands[i].is_some() || self.responses[i].is_some())
            .map(|i| i as u16)
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.commands.fill(None);
        self.responses.fill(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaBuf, MemoryKey, RegisteredBuf};
    use crate::fabric::CompletionError;
    use crate::nvmf::command::Callback;

    struct Nop;

    impl Callback for Nop {
        fn on_complete(&self) {}
        fn on_failure(&self, _reason: CompletionError) {}
    }

    fn pair() -> (Arc<Command>, Arc<Response>) {
        let key = MemoryKey {
            addr: 0,
            length: 64,
            lkey: 0,
            rkey: 0,
        };
        let capsule = RegisteredBuf::new(DmaBuf::alloc(64).unwrap(), key);
        (
            Arc::new(Command::new(capsule, 64, Arc::new(Nop)).unwrap()),
            Arc::new(Response::new(Arc::new(Nop))),
        )
    }

    #[test]
    fn test_slots_clear_independently() {
        let mut reg = Registry::new(4);
        let (cmd, resp) = pair();
        reg.insert(2, cmd, resp);
        assert_eq!(reg.in_flight(), vec![2]);

        assert!(reg.take_response(2).is_some());
        assert!(reg.has_command(2));
        assert_eq!(reg.in_flight(), vec![2]);

        assert!(reg.take_command(2).is_some());
        assert!(reg.take_command(2).is_none());
        assert!(reg.in_flight().is_empty());
    }

    #[test]
    fn test_out_of_range() {
        let mut reg = Registry::new(2);
        assert!(reg.take_command(7).is_none());
        assert!(reg.take_response(7).is_none());
        assert!(!reg.has_command(7));
        reg.remove(7);
    }

    #[test]
    fn test_pending_responses_and_clear() {
        let mut reg = Registry::new(4);
        for cid in [0, 3] {
            let (cmd, resp) = pair();
            reg.insert(cid, cmd, resp);
        }
        reg.take_command(0);
        assert_eq!(reg.pending_responses().len(), 2);
        assert!(reg.has_response(3));

        reg.clear();
        assert!(reg.pending_responses().is_empty());
        assert!(reg.in_flight().is_empty());
    }
}
