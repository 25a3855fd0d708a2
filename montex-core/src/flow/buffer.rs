use montex_model::StreamTime;

/// A unit of media data. The engine never looks at payloads, only at
/// timestamps, so buffers carry timing alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Buffer {
    pub pts: StreamTime,
    pub duration: StreamTime,
}

impl Buffer {
    pub fn new(pts: StreamTime, duration: StreamTime) -> Buffer {
        Buffer { pts, duration }
    }
}
