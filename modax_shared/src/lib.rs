// modax_shared: wire contract shared by the supervisory host, field hardware and the advisory tier

pub mod advisory;
pub mod command;
pub mod geometry;
pub mod telemetry;
pub mod wire;

pub use advisory::{Recommendation, RecommendationKind};
pub use command::{
    CommandAck, CommandKind, CommandOrigin, CommandOutcome, CommandResult, ControlCommand,
    CoolantMode, SpindleDirection,
};
pub use geometry::{
    ArcDirection, ArcGeometry, CompSide, CutterComp, PathSegment, Plane, Point, SegmentKind,
};
pub use telemetry::{
    AggregatedWindow, ChannelStats, SafetyFrame, SafetyStatus, SensorSample, Vibration,
};
pub use wire::{decode_line, encode_line, DeviceMessage, WireError};
