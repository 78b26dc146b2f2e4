//! Job graph builder.
//!
//! Turns a pristine [`WorkflowTemplate`] plus the user's
//! [`GenerationParameters`] into a fully parameterized [`JobGraph`].
//! The builder never touches the network: input images must already be
//! uploaded and their server-side filenames passed in.

use crate::error::StudioError;
use crate::graph::{JobGraph, NodeLink};
use crate::params::{GenerationMode, GenerationParameters, LoraEntry, MAX_LORAS};
use crate::templates::{
    edit_nodes, generate_nodes, required_nodes, video_nodes, WorkflowTemplate,
    CLONED_LOADER_OFFSET,
};

// ---------------------------------------------------------------------------
// Formulas
// ---------------------------------------------------------------------------

/// Frames per second of generated video.
pub const VIDEO_FPS: u32 = 16;

/// Pixel budget for the edit-mode scaling node, never below 1 MP.
///
/// `max(1, round(width * height / 100000) / 10)`
pub fn target_megapixels(width: u32, height: u32) -> f64 {
    let pixels = f64::from(width) * f64::from(height);
    ((pixels / 100_000.0).round() / 10.0).max(1.0)
}

/// Frame count for a clip: one more than a multiple of 16.
pub fn video_frame_count(duration_seconds: u32) -> u32 {
    VIDEO_FPS * duration_seconds + 1
}

/// Prompt text with the optional style suffix appended.
pub fn styled_prompt(prompt: &str, style_suffix: Option<&str>) -> String {
    match style_suffix.map(str::trim).filter(|s| !s.is_empty()) {
        Some(suffix) if prompt.trim().is_empty() => suffix.to_string(),
        Some(suffix) => format!("{}, {suffix}", prompt.trim_end()),
        None => prompt.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Checks that need neither uploads nor a working copy of the graph.
///
/// Run this before uploading anything so that a stale template or bad
/// input aborts without a single network call.
pub fn preflight(
    template: &WorkflowTemplate,
    params: &GenerationParameters,
) -> Result<(), StudioError> {
    if template.mode() != params.mode {
        return Err(StudioError::Configuration(format!(
            "{} template cannot build a {} job",
            template.mode(),
            params.mode
        )));
    }
    let required = required_nodes(params.mode, params.extend_requested());
    if let Some(missing) = template.graph().missing_nodes(&required).first() {
        return Err(StudioError::missing_node(params.mode.as_str(), missing));
    }
    params.validate()
}

/// Build the graph for one submission.
///
/// `input_filenames` are the server-side names of the input images, in the
/// same order as `params.input_images`.
pub fn build_job_graph(
    template: &WorkflowTemplate,
    params: &GenerationParameters,
    input_filenames: &[String],
) -> Result<JobGraph, StudioError> {
    preflight(template, params)?;
    if input_filenames.len() != params.input_images.len() {
        return Err(StudioError::Validation(format!(
            "Expected {} uploaded image(s), got {}",
            params.input_images.len(),
            input_filenames.len()
        )));
    }

    let mut graph = template.graph().clone();
    match params.mode {
        GenerationMode::Edit => build_edit(&mut graph, params, input_filenames)?,
        GenerationMode::Generate => build_generate(&mut graph, params)?,
        GenerationMode::Video => build_video(&mut graph, params, input_filenames)?,
    }

    graph.validate()?;
    Ok(graph)
}

// ---------------------------------------------------------------------------
// Per-mode wiring
// ---------------------------------------------------------------------------

fn build_edit(
    graph: &mut JobGraph,
    params: &GenerationParameters,
    images: &[String],
) -> Result<(), StudioError> {
    use edit_nodes::*;

    apply_sampler(graph, SAMPLER, "seed", params)?;
    graph.set_input(POSITIVE, "prompt", params.prompt.as_str())?;
    graph.set_input(NEGATIVE, "prompt", params.negative_prompt.as_str())?;

    let (width, height) = params.resolution.dimensions()?;
    graph.set_input(SCALE, "megapixels", target_megapixels(width, height))?;

    wire_edit_images(graph, images)?;
    apply_lora_stack(graph, LORA_STACK, &params.loras)
}

/// First image reuses the template loader; every further image gets a
/// cloned loader under a synthetic ID and is wired into `image{n}` of both
/// text encoders.
fn wire_edit_images(graph: &mut JobGraph, images: &[String]) -> Result<(), StudioError> {
    use edit_nodes::*;

    let Some((first, rest)) = images.split_first() else {
        return Err(StudioError::Validation(
            "edit mode needs an input image".to_string(),
        ));
    };

    graph.set_input(LOAD_IMAGE, "image", first.as_str())?;
    for encoder in [POSITIVE, NEGATIVE] {
        graph.set_input(encoder, "image1", NodeLink::new(LOAD_IMAGE, 0))?;
    }

    let loader = graph
        .node(LOAD_IMAGE)
        .cloned()
        .ok_or_else(|| StudioError::missing_node("edit", LOAD_IMAGE))?;

    for (index, filename) in rest.iter().enumerate() {
        let clone_index = index as u32 + 1;
        let clone_id = (CLONED_LOADER_OFFSET + clone_index).to_string();
        graph.insert(clone_id.clone(), loader.clone());
        graph.set_input(&clone_id, "image", filename.as_str())?;

        let slot = format!("image{}", clone_index + 1);
        for encoder in [POSITIVE, NEGATIVE] {
            graph.set_input(encoder, &slot, NodeLink::new(clone_id.as_str(), 0))?;
        }
    }

    // Slots beyond the provided images must not point anywhere.
    for unused in images.len() + 1..=GenerationMode::Edit.max_input_images() {
        let slot = format!("image{unused}");
        for encoder in [POSITIVE, NEGATIVE] {
            graph.clear_input(encoder, &slot);
        }
    }
    Ok(())
}

fn build_generate(graph: &mut JobGraph, params: &GenerationParameters) -> Result<(), StudioError> {
    use generate_nodes::*;

    apply_sampler(graph, SAMPLER, "seed", params)?;
    let text = styled_prompt(&params.prompt, params.style_suffix.as_deref());
    graph.set_input(POSITIVE, "text", text)?;
    graph.set_input(NEGATIVE, "text", params.negative_prompt.as_str())?;

    let (width, height) = params.resolution.dimensions()?;
    graph.set_input(LATENT, "width", width)?;
    graph.set_input(LATENT, "height", height)?;

    apply_lora_stack(graph, LORA_STACK, &params.loras)
}

fn build_video(
    graph: &mut JobGraph,
    params: &GenerationParameters,
    images: &[String],
) -> Result<(), StudioError> {
    use video_nodes::*;

    let image = images.first().ok_or_else(|| {
        StudioError::Validation("video mode needs an input image".to_string())
    })?;
    graph.set_input(LOAD_IMAGE, "image", image.as_str())?;
    graph.set_input(POSITIVE, "text", params.prompt.as_str())?;
    graph.set_input(NEGATIVE, "text", params.negative_prompt.as_str())?;

    let (width, height) = params.resolution.dimensions()?;
    graph.set_input(IMAGE_TO_VIDEO, "width", width)?;
    graph.set_input(IMAGE_TO_VIDEO, "height", height)?;
    graph.set_input(
        IMAGE_TO_VIDEO,
        "length",
        video_frame_count(params.video.duration_seconds),
    )?;

    // The two samplers split the schedule: high noise first half, low noise rest.
    let split = (params.steps / 2).max(1);
    for sampler in [SAMPLER_HIGH, SAMPLER_LOW] {
        apply_sampler(graph, sampler, "noise_seed", params)?;
    }
    graph.set_input(SAMPLER_HIGH, "start_at_step", 0u32)?;
    graph.set_input(SAMPLER_HIGH, "end_at_step", split)?;
    graph.set_input(SAMPLER_LOW, "start_at_step", split)?;
    graph.set_input(SAMPLER_LOW, "end_at_step", 10_000u32)?;

    if !params.video.extend {
        // Nothing downstream references the extend stage.
        graph.remove(INTERPOLATE);
        graph.remove(SAVE_EXTENDED);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn apply_sampler(
    graph: &mut JobGraph,
    node_id: &str,
    seed_input: &str,
    params: &GenerationParameters,
) -> Result<(), StudioError> {
    graph.set_input(node_id, seed_input, params.seed)?;
    graph.set_input(node_id, "steps", params.steps)?;
    graph.set_input(node_id, "sampler_name", params.sampler_name.as_str())?;
    graph.set_input(node_id, "scheduler", params.scheduler_name.as_str())?;
    Ok(())
}

/// Write all ten stack slots: active entries first in list order, then
/// the `"None"` / `1.0` sentinel the backend node expects.
pub fn apply_lora_stack(
    graph: &mut JobGraph,
    node_id: &str,
    loras: &[LoraEntry],
) -> Result<(), StudioError> {
    if loras.len() > MAX_LORAS {
        return Err(StudioError::Validation(format!(
            "At most {MAX_LORAS} LoRAs can be stacked (got {})",
            loras.len()
        )));
    }

    let active: Vec<&LoraEntry> = loras.iter().filter(|l| l.is_active()).collect();
    graph.set_input(node_id, "lora_count", active.len() as u32)?;

    for slot in 1..=MAX_LORAS {
        let (name, strength) = match active.get(slot - 1) {
            Some(entry) => (entry.name.as_str(), entry.strength),
            None => ("None", 1.0),
        };
        graph.set_input(node_id, &format!("lora_{slot}_name"), name)?;
        graph.set_input(node_id, &format!("lora_{slot}_strength"), strength)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
