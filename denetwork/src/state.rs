//! Ordered sequence of [`Value`]s exposed at stable, dense indices.
//!
//! A `State` is either the writable, locally-owned side of a link (values
//! are mutated directly by the application and change-detected by
//! [`State::sync`]) or the read-only, remote-mirroring side (values are
//! only ever replaced wholesale by [`State::apply_update`] when a
//! `LINK_UPDATE` datagram arrives). The distinction is enforced at
//! runtime rather than via separate types, matching how a `StateLink`
//! flips direction depending on who initiated the link.

use crate::codec::Reader;
use crate::error::{FailureReason, NetworkError, NetworkResult};
use crate::value::Value;

pub struct State {
    values: Vec<Value>,
    invalidated: Vec<bool>,
    read_only: bool,
    linked: bool,
}

impl State {
    pub fn new(read_only: bool) -> State {
        State {
            values: Vec::new(),
            invalidated: Vec::new(),
            read_only,
            linked: false,
        }
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Freezes the value schema: called once when a `StateLink` is created
    /// from this state. The schema is fixed for the lifetime of the state
    /// from then on, matching the wire contract that a link's index space
    /// never changes underneath the peer that already agreed to it.
    pub fn mark_linked(&mut self) {
        self.linked = true;
    }

    /// Appends a value, returning the dense index it will keep for the
    /// lifetime of this state. The value starts invalidated so its first
    /// `sync` always reports it as changed. Fails once the state has been
    /// linked: the schema is fixed from that point on.
    pub fn add_value(&mut self, value: Value) -> NetworkResult<usize> {
        if self.linked {
            return Err(NetworkError::Fatal(FailureReason::Generic));
        }
        self.values.push(value);
        self.invalidated.push(true);
        Ok(self.values.len() - 1)
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn value_mut(&mut self, index: usize) -> Option<&mut Value> {
        self.values.get_mut(index)
    }

    /// Finds the index of the first value whose current contents equal
    /// `needle`, comparing with [`Value::value_equals`].
    pub fn index_of(&self, needle: &Value) -> Option<usize> {
        self.values.iter().position(|v| v.value_equals(needle))
    }

    /// The wire schema this state presents: the value-type tag of each
    /// value in index order. Used to validate a `LINK_STATE` exchange.
    pub fn schema(&self) -> Vec<crate::proto::ValueType> {
        self.values.iter().map(|v| v.value_type()).collect()
    }

    /// Forces the value at `index` to be reported as changed on the next
    /// `sync`, regardless of whether it actually differs from its last
    /// sent snapshot. Used to re-arm a value after a link that was down
    /// comes back up, so the peer gets a fresh full picture.
    pub fn invalidate_value(&mut self, index: usize) {
        if let Some(flag) = self.invalidated.get_mut(index) {
            *flag = true;
        }
    }

    /// Change-detects every value, returning the indices that need to be
    /// resent. Only valid on a writable (non-read-only) state.
    pub fn sync(&mut self, force: bool) -> Vec<usize> {
        let mut changed = Vec::new();
        for (i, value) in self.values.iter_mut().enumerate() {
            let forced = force || self.invalidated[i];
            self.invalidated[i] = false;
            if value.update_value(forced) {
                changed.push(i);
            }
        }
        changed
    }

    /// Replaces the value at `index` by reading a fresh one off the wire.
    /// Only valid on a read-only state; a writable state's values are
    /// mutated by the application, never by the network.
    pub fn apply_update(&mut self, index: usize, reader: &mut Reader<'_>) -> NetworkResult<()> {
        if !self.read_only {
            return Err(NetworkError::Fatal(FailureReason::InvalidMessage));
        }
        let value = self
            .values
            .get_mut(index)
            .ok_or(NetworkError::Fatal(FailureReason::InvalidMessage))?;
        value.read(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::IntFormat;

    #[test]
    fn new_value_is_dirty_on_first_sync() {
        let mut state = State::new(false);
        state.add_value(Value::int(IntFormat::Sint32, 5)).unwrap();
        assert_eq!(state.sync(false), vec![0]);
        // Second sync with no changes and no force: clean.
        assert!(state.sync(false).is_empty());
    }

    #[test]
    fn invalidate_forces_resync_even_without_change() {
        let mut state = State::new(false);
        state.add_value(Value::int(IntFormat::Sint32, 5)).unwrap();
        state.sync(false);
        state.invalidate_value(0);
        assert_eq!(state.sync(false), vec![0]);
    }

    #[test]
    fn apply_update_rejects_writable_state() {
        let mut state = State::new(false);
        state.add_value(Value::int(IntFormat::Sint32, 5)).unwrap();
        let buf = [0u8; 4];
        let mut reader = Reader::new(&buf);
        assert!(state.apply_update(0, &mut reader).is_err());
    }

    #[test]
    fn apply_update_replaces_value_on_read_only_state() {
        let mut state = State::new(true);
        state.add_value(Value::int(IntFormat::Sint32, 0)).unwrap();

        let mut buf = Vec::new();
        {
            let mut w = crate::codec::Writer::new(&mut buf);
            w.write_int(77);
        }
        let mut reader = Reader::new(&buf);
        state.apply_update(0, &mut reader).unwrap();

        match state.value(0).unwrap() {
            Value::Int { value, .. } => assert_eq!(*value, 77),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn out_of_range_index_is_invalid_message() {
        let mut state = State::new(true);
        let buf = [0u8; 4];
        let mut reader = Reader::new(&buf);
        assert!(state.apply_update(0, &mut reader).is_err());
    }

    #[test]
    fn add_value_fails_once_linked() {
        let mut state = State::new(false);
        state.add_value(Value::int(IntFormat::Sint32, 5)).unwrap();
        state.mark_linked();
        assert!(state.is_linked());
        assert!(state.add_value(Value::int(IntFormat::Sint32, 6)).is_err());
        // The schema stays exactly what it was before linking.
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn index_of_finds_matching_value() {
        let mut state = State::new(false);
        state.add_value(Value::int(IntFormat::Sint32, 5)).unwrap();
        state.add_value(Value::string("hello")).unwrap();
        assert_eq!(state.index_of(&Value::string("hello")), Some(1));
        assert_eq!(state.index_of(&Value::int(IntFormat::Sint32, 5)), Some(0));
        assert_eq!(state.index_of(&Value::string("missing")), None);
    }

    #[test]
    fn schema_reports_value_types_in_index_order() {
        let mut state = State::new(false);
        state.add_value(Value::int(IntFormat::Sint32, 5)).unwrap();
        state.add_value(Value::string("")).unwrap();
        assert_eq!(
            state.schema(),
            vec![crate::proto::ValueType::Sint32, crate::proto::ValueType::String]
        );
    }
}
