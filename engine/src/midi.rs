use serde::{Deserialize, Serialize};

/// Raw MIDI message valid for the current cycle. `frame` is the offset from
/// the start of the cycle, not an absolute sample position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MidiEvent {
    pub frame: u32,
    pub data: Vec<u8>,
}

impl MidiEvent {
    pub fn new(frame: u32, data: Vec<u8>) -> Self {
        Self { frame, data }
    }

    pub fn note_on(frame: u32, pitch: u8, velocity: u8) -> Self {
        Self::new(frame, vec![0x90, pitch & 0x7f, velocity & 0x7f])
    }

    pub fn note_off(frame: u32, pitch: u8) -> Self {
        Self::new(frame, vec![0x80, pitch & 0x7f, 0])
    }
}

/// Per-cycle event list of an event port. Cleared at the start of every
/// cycle; merged from connected sources before the owning node runs.
#[derive(Clone, Debug, Default)]
pub struct MidiEvents {
    events: Vec<MidiEvent>,
}

impl MidiEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: MidiEvent) {
        self.events.push(event);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MidiEvent> {
        self.events.iter()
    }

    /// Appends another list, keeping each event's original timestamp.
    pub fn extend_from(&mut self, other: &MidiEvents) {
        self.events.extend(other.events.iter().cloned());
    }

    /// Restores timestamp order after merging. The sort is stable, so
    /// events at the same frame keep source-enumeration order.
    pub fn sort(&mut self) {
        self.events.sort_by_key(|event| event.frame);
    }
}

/// A note inside a `MidiClip`. `tick` is relative to the clip start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiNote {
    pub tick: u64,
    pub duration: u64,
    pub pitch: u8,
    pub velocity: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_timestamp_order() {
        let mut a = MidiEvents::new();
        a.push(MidiEvent::note_on(5, 60, 100));
        a.push(MidiEvent::note_on(1, 62, 100));
        let mut b = MidiEvents::new();
        b.push(MidiEvent::note_on(3, 64, 100));

        let mut merged = MidiEvents::new();
        merged.extend_from(&a);
        merged.extend_from(&b);
        merged.sort();

        let frames: Vec<u32> = merged.iter().map(|e| e.frame).collect();
        assert_eq!(frames, vec![1, 3, 5]);
    }

    #[test]
    fn merge_ties_keep_source_enumeration_order() {
        let mut a = MidiEvents::new();
        a.push(MidiEvent::note_on(4, 60, 100));
        let mut b = MidiEvents::new();
        b.push(MidiEvent::note_on(4, 72, 100));

        let mut merged = MidiEvents::new();
        merged.extend_from(&a);
        merged.extend_from(&b);
        merged.sort();

        let pitches: Vec<u8> = merged.iter().map(|e| e.data[1]).collect();
        assert_eq!(pitches, vec![60, 72]);
    }
}
