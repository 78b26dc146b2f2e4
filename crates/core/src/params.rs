//! User-facing generation parameters.
//!
//! A [`GenerationParameters`] value is assembled from UI state right
//! before each submission and is never persisted as a unit.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StudioError;

/* --------------------------------------------------------------------------
Constants
-------------------------------------------------------------------------- */

/// Upper bound on LoRA entries; the backend stack node has exactly this many slots.
pub const MAX_LORAS: usize = 10;

/// Fallback used when a custom width is empty or non-positive.
pub const DEFAULT_WIDTH: u32 = 720;

/// Fallback used when a custom height is empty or non-positive.
pub const DEFAULT_HEIGHT: u32 = 1280;

/// Maximum dimension (width or height) accepted for explicit sizes.
pub const MAX_DIMENSION: u32 = 7680;

/// Longest video clip, in seconds.
pub const MAX_VIDEO_SECONDS: u32 = 10;

/* --------------------------------------------------------------------------
Mode
-------------------------------------------------------------------------- */

/// Which workflow template a submission is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    Edit,
    Generate,
    Video,
}

impl GenerationMode {
    pub const ALL: [GenerationMode; 3] = [Self::Edit, Self::Generate, Self::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::Generate => "generate",
            Self::Video => "video",
        }
    }

    /// How many input images the mode accepts.
    pub fn max_input_images(&self) -> usize {
        match self {
            Self::Edit => 3,
            Self::Generate => 0,
            Self::Video => 1,
        }
    }

    /// Whether the mode cannot run without at least one input image.
    pub fn requires_input_image(&self) -> bool {
        !matches!(self, Self::Generate)
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edit" => Ok(Self::Edit),
            "generate" => Ok(Self::Generate),
            "video" => Ok(Self::Video),
            other => Err(StudioError::Validation(format!(
                "Unknown generation mode '{other}'"
            ))),
        }
    }
}

/* --------------------------------------------------------------------------
Resolution
-------------------------------------------------------------------------- */

/// Preset aspect ratios offered for text-to-image and edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    Square,
    Portrait9x16,
    Landscape16x9,
    Portrait3x4,
    Landscape4x3,
    Portrait2x3,
    Landscape3x2,
}

impl AspectRatio {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Square => (1024, 1024),
            Self::Portrait9x16 => (720, 1280),
            Self::Landscape16x9 => (1280, 720),
            Self::Portrait3x4 => (864, 1152),
            Self::Landscape4x3 => (1152, 864),
            Self::Portrait2x3 => (832, 1248),
            Self::Landscape3x2 => (1248, 832),
        }
    }
}

impl FromStr for AspectRatio {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1:1" => Ok(Self::Square),
            "9:16" => Ok(Self::Portrait9x16),
            "16:9" => Ok(Self::Landscape16x9),
            "3:4" => Ok(Self::Portrait3x4),
            "4:3" => Ok(Self::Landscape4x3),
            "2:3" => Ok(Self::Portrait2x3),
            "3:2" => Ok(Self::Landscape3x2),
            other => Err(StudioError::Validation(format!(
                "Unknown aspect ratio '{other}'"
            ))),
        }
    }
}

/// Video output sizes, looked up by resolution ID.
pub fn video_resolution(id: &str) -> Option<(u32, u32)> {
    match id {
        "480p" => Some((480, 832)),
        "480p-landscape" => Some((832, 480)),
        "720p" => Some((720, 1280)),
        "720p-landscape" => Some((1280, 720)),
        _ => None,
    }
}

/// How the output size was chosen in the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Exact size, already validated by the caller.
    Explicit { width: u32, height: u32 },
    /// One of the preset aspect ratios.
    Aspect(AspectRatio),
    /// Raw text the user typed into the custom width/height fields.
    Custom { width: String, height: String },
    /// Video resolution ID, see [`video_resolution`].
    Preset(String),
}

impl Default for Resolution {
    fn default() -> Self {
        Self::Explicit {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

impl Resolution {
    /// Concrete `(width, height)` in pixels.
    ///
    /// Custom entries never fail: an empty, unparsable or non-positive
    /// field falls back to [`DEFAULT_WIDTH`] / [`DEFAULT_HEIGHT`].
    pub fn dimensions(&self) -> Result<(u32, u32), StudioError> {
        let (width, height) = match self {
            Self::Explicit { width, height } => (*width, *height),
            Self::Aspect(ratio) => ratio.dimensions(),
            Self::Custom { width, height } => (
                parse_custom_dimension(width).unwrap_or(DEFAULT_WIDTH),
                parse_custom_dimension(height).unwrap_or(DEFAULT_HEIGHT),
            ),
            Self::Preset(id) => video_resolution(id).ok_or_else(|| {
                StudioError::Validation(format!("Unknown video resolution '{id}'"))
            })?,
        };
        validate_dimensions(width, height)?;
        Ok((width, height))
    }
}

fn parse_custom_dimension(raw: &str) -> Option<u32> {
    let value: i64 = raw.trim().parse().ok()?;
    if value <= 0 {
        return None;
    }
    u32::try_from(value).ok()
}

/// Validate that width and height are positive and within bounds.
pub fn validate_dimensions(width: u32, height: u32) -> Result<(), StudioError> {
    if width == 0 || height == 0 {
        return Err(StudioError::Validation(
            "Width and height must be greater than 0".to_string(),
        ));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(StudioError::Validation(format!(
            "Dimensions must not exceed {MAX_DIMENSION}px (got {width}x{height})"
        )));
    }
    Ok(())
}

/* --------------------------------------------------------------------------
LoRA stack and input images
-------------------------------------------------------------------------- */

/// One entry of the ordered LoRA stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraEntry {
    pub name: String,
    pub strength: f64,
    pub enabled: bool,
}

impl LoraEntry {
    pub fn new(name: impl Into<String>, strength: f64) -> Self {
        Self {
            name: name.into(),
            strength,
            enabled: true,
        }
    }

    /// Enabled and pointing at an actual model file.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.name.trim().is_empty() && self.name != "None"
    }
}

/// Where an input image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageRef {
    /// A file on this device; uploaded before the graph is built.
    Local(PathBuf),
    /// A file already present in the backend's input folder.
    Server(String),
}

/* --------------------------------------------------------------------------
Parameters
-------------------------------------------------------------------------- */

/// Video-only knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoOptions {
    pub duration_seconds: u32,
    /// Run the interpolation / second-encode stage.
    pub extend: bool,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            duration_seconds: 3,
            extend: false,
        }
    }
}

/// Everything the builder needs to parameterize one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub mode: GenerationMode,
    pub prompt: String,
    pub negative_prompt: String,
    /// Appended to the prompt in generate mode.
    pub style_suffix: Option<String>,
    pub seed: u64,
    pub resolution: Resolution,
    pub sampler_name: String,
    pub scheduler_name: String,
    pub steps: u32,
    pub loras: Vec<LoraEntry>,
    pub input_images: Vec<ImageRef>,
    pub video: VideoOptions,
}

impl GenerationParameters {
    /// Defaults for `mode` with the given prompt.
    pub fn new(mode: GenerationMode, prompt: impl Into<String>) -> Self {
        let (sampler_name, scheduler_name, steps) = match mode {
            GenerationMode::Edit => ("euler", "simple", 4),
            GenerationMode::Generate => ("res_multistep", "simple", 8),
            GenerationMode::Video => ("euler", "simple", 4),
        };
        let resolution = match mode {
            GenerationMode::Video => Resolution::Preset("480p".to_string()),
            _ => Resolution::default(),
        };
        Self {
            mode,
            prompt: prompt.into(),
            negative_prompt: String::new(),
            style_suffix: None,
            seed: 0,
            resolution,
            sampler_name: sampler_name.to_string(),
            scheduler_name: scheduler_name.to_string(),
            steps,
            loras: Vec::new(),
            input_images: Vec::new(),
            video: VideoOptions::default(),
        }
    }

    /// Whether the video interpolation stage should run.
    pub fn extend_requested(&self) -> bool {
        self.mode == GenerationMode::Video && self.video.extend
    }

    /// Local checks that need no template and no network.
    pub fn validate(&self) -> Result<(), StudioError> {
        if self.loras.len() > MAX_LORAS {
            return Err(StudioError::Validation(format!(
                "At most {MAX_LORAS} LoRAs can be stacked (got {})",
                self.loras.len()
            )));
        }
        if self.steps == 0 {
            return Err(StudioError::Validation(
                "Steps must be greater than 0".to_string(),
            ));
        }

        let max_images = self.mode.max_input_images();
        if self.mode.requires_input_image() && self.input_images.is_empty() {
            return Err(StudioError::Validation(format!(
                "{} mode needs an input image",
                self.mode
            )));
        }
        if self.input_images.len() > max_images {
            return Err(StudioError::Validation(format!(
                "{} mode accepts at most {max_images} input image(s) (got {})",
                self.mode,
                self.input_images.len()
            )));
        }

        if self.mode == GenerationMode::Video
            && !(1..=MAX_VIDEO_SECONDS).contains(&self.video.duration_seconds)
        {
            return Err(StudioError::Validation(format!(
                "Video duration must be between 1 and {MAX_VIDEO_SECONDS} seconds"
            )));
        }

        self.resolution.dimensions()?;
        Ok(())
    }
}

/* --------------------------------------------------------------------------
Tests
-------------------------------------------------------------------------- */
