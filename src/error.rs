//! Domain errors.

use std::time::Duration;

/// A configuration that cannot be run. Raised before any device is
/// contacted.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("could not read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML, or does not match the expected shape.
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// No printers are configured.
    #[error("no printers configured")]
    NoPrinters,

    /// Two printers share a name.
    #[error("printer name {0:?} is used more than once")]
    DuplicatePrinter(String),

    /// A device has neither an id nor a registration payload.
    #[error("{device} has neither an id nor a registration payload")]
    Unidentified {
        /// The device in question.
        device: String,
    },

    /// A printer references a rack that is not configured.
    #[error("printer {printer:?} references unknown rack {rack:?}")]
    UnknownRack {
        /// Printer name.
        printer: String,
        /// Rack label.
        rack: String,
    },

    /// A rack has no shelves.
    #[error("rack {0:?} has no shelves")]
    EmptyRack(String),

    /// A rotating slot policy was asked for on a printer without a rack.
    #[error("printer {0:?} uses rotating slots but has no rack")]
    RotatingWithoutRack(String),

    /// A job that must store its plate has no store slot.
    #[error("job {job:?} on printer {printer:?} has no store slot")]
    MissingStoreSlot {
        /// Printer name.
        printer: String,
        /// Job id.
        job: String,
    },

    /// A slot number falls outside its rack.
    #[error("{what} slot {slot} is outside rack {rack:?} (1..={shelves})")]
    SlotOutOfRange {
        /// Which slot this is, for instance `store` or `grab`.
        what: &'static str,
        /// The slot.
        slot: u32,
        /// Rack label.
        rack: String,
        /// Shelf count of the rack.
        shelves: u32,
    },

    /// Replaying the job list against the rack shows a conflict.
    #[error("job {job:?} on printer {printer:?}: {source}")]
    RackConflict {
        /// Printer name.
        printer: String,
        /// Job id.
        job: String,
        /// What went wrong.
        #[source]
        source: OccupancyError,
    },

    /// A numeric setting is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// A store or grab the rack cannot take.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OccupancyError {
    /// The slot is not part of the rack.
    #[error("slot {slot} is outside the rack (1-{shelves})")]
    OutOfRange {
        /// The slot.
        slot: u32,
        /// Shelf count of the rack.
        shelves: usize,
    },

    /// Storing onto a slot that still holds a fresh plate.
    #[error("cannot store to slot {0}: it holds a fresh plate")]
    HoldsFreshPlate(u32),

    /// Storing onto a slot that already holds a print.
    #[error("cannot store to slot {slot}: already occupied by {job}")]
    Occupied {
        /// The slot.
        slot: u32,
        /// Job whose print is there.
        job: String,
    },

    /// Grabbing from an empty slot.
    #[error("cannot grab from slot {0}: it is empty")]
    Empty(u32),

    /// Grabbing from a slot that holds a finished print.
    #[error("cannot grab from slot {slot}: it holds the print from {job}")]
    HoldsPrint {
        /// The slot.
        slot: u32,
        /// Job whose print is there.
        job: String,
    },
}

/// Why an ejection sequence did not complete.
#[derive(Debug, thiserror::Error)]
pub enum EjectionError {
    /// The job has no slot to store the finished plate in.
    #[error("job {job:?} has no store slot")]
    MissingStoreSlot {
        /// Job id.
        job: String,
    },

    /// A macro could not be dispatched.
    #[error("dispatch of {macro_name} failed")]
    Dispatch {
        /// Macro that failed.
        macro_name: String,
        /// Underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// The ejector did not report ONLINE in time after a macro.
    #[error("ejector not idle {timeout:?} after {macro_name}")]
    IdleTimeout {
        /// Macro that was running.
        macro_name: String,
        /// How long we waited.
        timeout: Duration,
    },

    /// The sequence stopped without finishing, for instance because its
    /// task panicked. Which steps ran is unknown.
    #[error("ejection sequence aborted: {0}")]
    Aborted(String),

    /// The coordinator task has gone away.
    #[error("ejector coordinator is not running")]
    CoordinatorGone,
}
