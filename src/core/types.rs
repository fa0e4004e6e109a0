//! Core value types that flow through the pipeline graph.
//!
//! The type system uses closed enums throughout:
//! - A camera pipeline addresses a small, fixed set of external ports
//! - Pixel formats form a finite set with well-known aliasing rules
//! - Serialization: serde handles enums natively, which keeps the
//!   declarative policy files readable

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic per-stream frame sequence number, assigned by the capture side.
pub type SequenceId = i64;

/// Identifier of a logical sub-stream (e.g. the video pipe vs. the still pipe).
pub type StreamId = i32;

/// Externally addressable routing key for buffers.
///
/// Ports are the only addresses collaborators ever see; the graph's internal
/// terminal identities never leak past the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Port {
    Main,
    Second,
    Third,
    Fourth,
}

impl Port {
    /// All ports in priority order. Used for default terminal assignment.
    pub fn all() -> &'static [Port] {
        &[Port::Main, Port::Second, Port::Third, Port::Fourth]
    }

    /// Numeric index of this port (0..3).
    pub fn index(&self) -> usize {
        match self {
            Port::Main => 0,
            Port::Second => 1,
            Port::Third => 2,
            Port::Fourth => 3,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port{}", self.index())
    }
}

/// Pixel formats understood by the binder.
///
/// The set is deliberately small: the engine never touches pixel data, it
/// only needs formats for structural compatibility checks during binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Nv12,
    Yuv420,
    P010,
    /// 10-bit Bayer, GRBG order.
    Sgrbg10,
    /// 10-bit Bayer, RGGB order.
    Srggb10,
    /// 12-bit Bayer, GRBG order.
    Sgrbg12,
    /// 12-bit Bayer, RGGB order.
    Srggb12,
    Rgb888,
    /// Vendor-opaque payload, matched by identity only.
    Opaque,
}

impl PixelFormat {
    /// Normalize format aliases for binding purposes.
    ///
    /// Processing stages accept GRBG Bayer input while capture hardware
    /// delivers RGGB of the same bit depth; the stage crops to GRBG itself,
    /// so the two are treated as one format when binding ports.
    pub fn canonical(&self) -> PixelFormat {
        match self {
            PixelFormat::Srggb10 => PixelFormat::Sgrbg10,
            PixelFormat::Srggb12 => PixelFormat::Sgrbg12,
            other => *other,
        }
    }

    /// Bytes per pixel rounded up to whole bytes, as stored in memory.
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Nv12 | PixelFormat::Yuv420 => 1,
            PixelFormat::P010 => 2,
            PixelFormat::Sgrbg10 | PixelFormat::Srggb10 => 2,
            PixelFormat::Sgrbg12 | PixelFormat::Srggb12 => 2,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Opaque => 1,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::P010 => "P010",
            PixelFormat::Sgrbg10 => "SGRBG10",
            PixelFormat::Srggb10 => "SRGGB10",
            PixelFormat::Sgrbg12 => "SGRBG12",
            PixelFormat::Srggb12 => "SRGGB12",
            PixelFormat::Rgb888 => "RGB888",
            PixelFormat::Opaque => "OPAQUE",
        };
        write!(f, "{}", name)
    }
}

/// Height alignment unit used by the processing hardware.
const HEIGHT_ALIGN: u32 = 32;

fn align_height(height: u32) -> u32 {
    (height + HEIGHT_ALIGN - 1) / HEIGHT_ALIGN * HEIGHT_ALIGN
}

/// Frame geometry and format of one stream, internal or external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Logical sub-stream this config belongs to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
}

impl StreamConfig {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            stream_id: None,
        }
    }

    pub fn with_stream_id(mut self, id: StreamId) -> Self {
        self.stream_id = Some(id);
        self
    }

    /// Line stride in bytes, derived from width and format.
    pub fn stride(&self) -> u32 {
        self.width * self.format.bytes_per_pixel()
    }

    /// Frame size in bytes, with hardware-aligned height.
    pub fn frame_size(&self) -> usize {
        (self.stride() as usize) * (align_height(self.height) as usize)
    }

    /// Structural compatibility test between an internal terminal config and
    /// an externally declared stream.
    ///
    /// When `check_stream_id` is set and both sides name a stream id, the id
    /// decides alone. Otherwise the formats must match after alias
    /// normalization, the heights must match up to one alignment unit, and
    /// either the widths or the strides must be equal.
    pub fn is_compatible(&self, external: &StreamConfig, check_stream_id: bool) -> bool {
        if check_stream_id {
            if let (Some(internal_id), Some(external_id)) = (self.stream_id, external.stream_id) {
                return internal_id == external_id;
            }
        }

        if self.format.canonical() != external.format.canonical() {
            return false;
        }

        let same_height =
            self.height == external.height || self.height == align_height(external.height);

        same_height && (self.width == external.width || self.stride() == external.stride())
    }
}

/// The two logical sub-stream classes a stage can belong to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    #[default]
    Video,
    Still,
}

/// Consumer-visible usage tag carried on a buffer.
///
/// The usage tag drives the shared-output-port tie-break: a still-capture
/// tagged output selects the still branch of a forked pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameUsage {
    #[default]
    Preview,
    Video,
    StillCapture,
    /// Raw passthrough buffer kept for reprocessing.
    Opaque,
}

/// Whether a stage announces its frame result before or after its stats.
///
/// Stats-first stages feed tuning loops whose results the next stage needs;
/// frame-first is the default so consumers see frames as early as possible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOrder {
    #[default]
    FrameFirst,
    StatsFirst,
}
