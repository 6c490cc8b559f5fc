//! Storage rack slots: rotating assignment and occupancy checks.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::OccupancyError;

/// Rotating store-slot counter for one rack. The value always stays within
/// `1..=shelves`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTracker {
    current: u32,
    shelves: u32,
}

impl SlotTracker {
    /// A tracker over `shelves` slots, starting at `start` (clamped into
    /// range). Returns `None` for a rack without shelves.
    pub fn new(shelves: u32, start: u32) -> Option<Self> {
        if shelves == 0 {
            return None;
        }
        Some(Self {
            current: start.clamp(1, shelves),
            shelves,
        })
    }

    /// Slot the next plate will be stored in.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Number of slots in the rack.
    pub fn shelves(&self) -> u32 {
        self.shelves
    }

    /// Move on to the next slot, wrapping after the last one. Returns the
    /// new current slot.
    pub fn advance(&mut self) -> u32 {
        self.current = (self.current % self.shelves) + 1;
        self.current
    }
}

/// How store and grab slots are chosen for a printer's jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SlotPolicy {
    /// Every job names its own slots.
    Explicit,

    /// Store slots rotate through the rack; replacement plates always come
    /// from the rack's fixed grab slot.
    Rotating {
        /// Rack label.
        rack: String,
    },
}

impl SlotPolicy {
    /// Macro name addressing `slot`, for instance `STORE_TO_SLOT_3` or, for
    /// a rotating rack labelled `A`, `STORE_TO_SLOT_A_3`.
    pub fn slot_macro(&self, prefix: &str, slot: u32) -> String {
        match self {
            SlotPolicy::Explicit => format!("{}_{}", prefix, slot),
            SlotPolicy::Rotating { rack } => format!("{}_{}_{}", prefix, rack, slot),
        }
    }

    /// Rack label, for rotating policies.
    pub fn rack(&self) -> Option<&str> {
        match self {
            SlotPolicy::Explicit => None,
            SlotPolicy::Rotating { rack } => Some(rack),
        }
    }
}

/// What a rack slot holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotContent {
    /// Nothing.
    Empty,
    /// A clean build plate, ready to be loaded.
    FreshPlate,
    /// A finished print, by job id.
    Print(String),
}

/// Simulated rack contents, used to check an explicit job list before the
/// run starts.
#[derive(Debug, Clone)]
pub struct RackOccupancy {
    slots: Vec<SlotContent>,
}

impl RackOccupancy {
    /// A rack of `shelves` slots, with fresh plates in `loaded`. Loaded slots
    /// outside the rack are ignored.
    pub fn new(shelves: u32, loaded: &[u32]) -> Self {
        let mut slots = vec![SlotContent::Empty; shelves as usize];
        for slot in loaded {
            if let Some(content) = slot.checked_sub(1).and_then(|i| slots.get_mut(i as usize)) {
                *content = SlotContent::FreshPlate;
            }
        }
        Self { slots }
    }

    /// Contents of a slot, if it exists.
    pub fn content(&self, slot: u32) -> Option<&SlotContent> {
        slot.checked_sub(1).and_then(|i| self.slots.get(i as usize))
    }

    fn content_mut(&mut self, slot: u32) -> Result<&mut SlotContent, OccupancyError> {
        let shelves = self.slots.len();
        slot.checked_sub(1)
            .and_then(|i| self.slots.get_mut(i as usize))
            .ok_or(OccupancyError::OutOfRange { slot, shelves })
    }

    /// Store a finished print. The slot must be empty.
    pub fn store(&mut self, slot: u32, job: &str) -> Result<(), OccupancyError> {
        let content = self.content_mut(slot)?;
        match content {
            SlotContent::Empty => {
                *content = SlotContent::Print(job.to_owned());
                Ok(())
            }
            SlotContent::FreshPlate => Err(OccupancyError::HoldsFreshPlate(slot)),
            SlotContent::Print(other) => Err(OccupancyError::Occupied {
                slot,
                job: other.clone(),
            }),
        }
    }

    /// Take a fresh plate. The slot must hold one.
    pub fn grab(&mut self, slot: u32) -> Result<(), OccupancyError> {
        let content = self.content_mut(slot)?;
        match content {
            SlotContent::FreshPlate => {
                *content = SlotContent::Empty;
                Ok(())
            }
            SlotContent::Empty => Err(OccupancyError::Empty(slot)),
            SlotContent::Print(job) => Err(OccupancyError::HoldsPrint {
                slot,
                job: job.clone(),
            }),
        }
    }

    /// Number of slots holding anything.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| **s != SlotContent::Empty).count()
    }
}
