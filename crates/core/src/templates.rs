//! Static workflow templates and the node layout the builder relies on.
//!
//! Three templates ship with the crate (`templates/*.json`). They can be
//! overridden from a directory at startup; either way the store hands out
//! shared references and the builder deep-clones before mutating, so the
//! stored graphs stay pristine for the lifetime of the process.

use std::path::Path;

use serde::Serialize;

use crate::error::StudioError;
use crate::graph::JobGraph;
use crate::params::GenerationMode;

const EDIT_TEMPLATE: &str = include_str!("../templates/edit.json");
const GENERATE_TEMPLATE: &str = include_str!("../templates/generate.json");
const VIDEO_TEMPLATE: &str = include_str!("../templates/video.json");

/// Synthetic IDs for cloned image loaders start above every template ID.
pub const CLONED_LOADER_OFFSET: u32 = 1000;

/* --------------------------------------------------------------------------
Node layout per template
-------------------------------------------------------------------------- */

/// Node IDs in the image-edit template.
pub mod edit_nodes {
    pub const UNET_LOADER: &str = "37";
    pub const CLIP_LOADER: &str = "38";
    pub const VAE_LOADER: &str = "39";
    pub const LORA_STACK: &str = "89";
    pub const LOAD_IMAGE: &str = "78";
    pub const SCALE: &str = "93";
    pub const POSITIVE: &str = "111";
    pub const NEGATIVE: &str = "110";
    pub const SAMPLER: &str = "3";
    pub const SAVE: &str = "79";

    pub const REQUIRED: &[&str] = &[
        SAMPLER, LOAD_IMAGE, SAVE, LORA_STACK, SCALE, POSITIVE, NEGATIVE,
    ];
}

/// Node IDs in the text-to-image template.
pub mod generate_nodes {
    pub const UNET_LOADER: &str = "1";
    pub const CLIP_LOADER: &str = "2";
    pub const VAE_LOADER: &str = "4";
    pub const LORA_STACK: &str = "5";
    pub const POSITIVE: &str = "6";
    pub const NEGATIVE: &str = "7";
    pub const LATENT: &str = "13";
    pub const SAMPLER: &str = "10";
    pub const SAVE: &str = "9";

    pub const REQUIRED: &[&str] = &[LORA_STACK, POSITIVE, NEGATIVE, LATENT, SAMPLER, SAVE];
}

/// Node IDs in the image-to-video template.
pub mod video_nodes {
    pub const CLIP_LOADER: &str = "84";
    pub const VAE_LOADER: &str = "90";
    pub const UNET_HIGH: &str = "95";
    pub const UNET_LOW: &str = "96";
    pub const POSITIVE: &str = "93";
    pub const NEGATIVE: &str = "89";
    pub const LOAD_IMAGE: &str = "97";
    pub const IMAGE_TO_VIDEO: &str = "98";
    pub const SAMPLER_HIGH: &str = "86";
    pub const SAMPLER_LOW: &str = "85";
    pub const SAVE: &str = "108";
    pub const INTERPOLATE: &str = "120";
    pub const SAVE_EXTENDED: &str = "121";

    pub const REQUIRED: &[&str] = &[
        POSITIVE,
        NEGATIVE,
        LOAD_IMAGE,
        IMAGE_TO_VIDEO,
        SAMPLER_HIGH,
        SAMPLER_LOW,
        SAVE,
    ];

    /// Only needed when the extend stage is requested.
    pub const EXTEND: &[&str] = &[INTERPOLATE, SAVE_EXTENDED];
}

/// Node IDs that must exist before a graph for `mode` may be mutated.
pub fn required_nodes(mode: GenerationMode, extend: bool) -> Vec<&'static str> {
    match mode {
        GenerationMode::Edit => edit_nodes::REQUIRED.to_vec(),
        GenerationMode::Generate => generate_nodes::REQUIRED.to_vec(),
        GenerationMode::Video => {
            let mut ids = video_nodes::REQUIRED.to_vec();
            if extend {
                ids.extend_from_slice(video_nodes::EXTEND);
            }
            ids
        }
    }
}

/// The node expected to hold the final artifact.
pub fn output_node(mode: GenerationMode, extend: bool) -> &'static str {
    match mode {
        GenerationMode::Edit => edit_nodes::SAVE,
        GenerationMode::Generate => generate_nodes::SAVE,
        GenerationMode::Video if extend => video_nodes::SAVE_EXTENDED,
        GenerationMode::Video => video_nodes::SAVE,
    }
}

/* --------------------------------------------------------------------------
Coarse phases
-------------------------------------------------------------------------- */

/// Textual phase shown next to the progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    LoadingModel,
    Generating,
    Interpolating,
    Saving,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Self::LoadingModel => "Loading model…",
            Self::Generating => "Generating…",
            Self::Interpolating => "Interpolating…",
            Self::Saving => "Saving…",
        }
    }
}

/// Map a well-known node ID reaching "executing" to a coarse phase.
pub fn phase_for_node(mode: GenerationMode, node_id: &str) -> Option<Phase> {
    use Phase::*;

    let table: &[(&str, Phase)] = match mode {
        GenerationMode::Edit => &[
            (edit_nodes::UNET_LOADER, LoadingModel),
            (edit_nodes::CLIP_LOADER, LoadingModel),
            (edit_nodes::VAE_LOADER, LoadingModel),
            (edit_nodes::LORA_STACK, LoadingModel),
            (edit_nodes::SAMPLER, Generating),
            (edit_nodes::SAVE, Saving),
        ],
        GenerationMode::Generate => &[
            (generate_nodes::UNET_LOADER, LoadingModel),
            (generate_nodes::CLIP_LOADER, LoadingModel),
            (generate_nodes::VAE_LOADER, LoadingModel),
            (generate_nodes::LORA_STACK, LoadingModel),
            (generate_nodes::SAMPLER, Generating),
            (generate_nodes::SAVE, Saving),
        ],
        GenerationMode::Video => &[
            (video_nodes::CLIP_LOADER, LoadingModel),
            (video_nodes::VAE_LOADER, LoadingModel),
            (video_nodes::UNET_HIGH, LoadingModel),
            (video_nodes::UNET_LOW, LoadingModel),
            (video_nodes::SAMPLER_HIGH, Generating),
            (video_nodes::SAMPLER_LOW, Generating),
            (video_nodes::INTERPOLATE, Interpolating),
            (video_nodes::SAVE, Saving),
            (video_nodes::SAVE_EXTENDED, Saving),
        ],
    };

    table
        .iter()
        .find(|(id, _)| *id == node_id)
        .map(|(_, phase)| *phase)
}

/* --------------------------------------------------------------------------
Template store
-------------------------------------------------------------------------- */

/// A parsed template bound to the mode it serves.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    mode: GenerationMode,
    graph: JobGraph,
}

impl WorkflowTemplate {
    pub fn new(mode: GenerationMode, graph: JobGraph) -> Self {
        Self { mode, graph }
    }

    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    /// Read-only view; use `.clone()` to get a mutable working copy.
    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    /// Node IDs from the required set that this template lacks.
    pub fn missing_nodes(&self, extend: bool) -> Vec<&'static str> {
        self.graph.missing_nodes(&required_nodes(self.mode, extend))
    }
}

/// The three templates, one per [`GenerationMode`].
#[derive(Debug, Clone)]
pub struct WorkflowTemplateStore {
    edit: WorkflowTemplate,
    generate: WorkflowTemplate,
    video: WorkflowTemplate,
}

impl WorkflowTemplateStore {
    /// Parse the templates compiled into the crate.
    pub fn builtin() -> Result<Self, StudioError> {
        Ok(Self {
            edit: parse_template(GenerationMode::Edit, EDIT_TEMPLATE)?,
            generate: parse_template(GenerationMode::Generate, GENERATE_TEMPLATE)?,
            video: parse_template(GenerationMode::Video, VIDEO_TEMPLATE)?,
        })
    }

    /// Built-in templates, with any `<mode>.json` found in `dir` taking
    /// precedence.
    pub fn with_overrides(dir: &Path) -> Result<Self, StudioError> {
        let mut store = Self::builtin()?;
        for mode in GenerationMode::ALL {
            let path = dir.join(format!("{}.json", mode.as_str()));
            if !path.is_file() {
                continue;
            }
            let json = std::fs::read_to_string(&path).map_err(|e| {
                StudioError::Configuration(format!(
                    "Failed to read template {}: {e}",
                    path.display()
                ))
            })?;
            let template = parse_template(mode, &json)?;
            tracing::info!(mode = %mode, path = %path.display(), "Loaded template override");
            store.replace(template);
        }
        Ok(store)
    }

    pub fn get(&self, mode: GenerationMode) -> &WorkflowTemplate {
        match mode {
            GenerationMode::Edit => &self.edit,
            GenerationMode::Generate => &self.generate,
            GenerationMode::Video => &self.video,
        }
    }

    pub fn replace(&mut self, template: WorkflowTemplate) {
        match template.mode {
            GenerationMode::Edit => self.edit = template,
            GenerationMode::Generate => self.generate = template,
            GenerationMode::Video => self.video = template,
        }
    }
}

fn parse_template(mode: GenerationMode, json: &str) -> Result<WorkflowTemplate, StudioError> {
    let graph = JobGraph::from_json(json)
        .map_err(|e| StudioError::Configuration(format!("{mode} template: {e}")))?;
    let template = WorkflowTemplate::new(mode, graph);
    let missing = template.missing_nodes(false);
    if !missing.is_empty() {
        // Not fatal here: the builder refuses to use it and names the node.
        tracing::warn!(mode = %mode, missing = ?missing, "Template lacks required nodes");
    }
    Ok(template)
}

/* --------------------------------------------------------------------------
Tests
-------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_templates_carry_every_required_node() {
        let store = WorkflowTemplateStore::builtin().unwrap();
        for mode in GenerationMode::ALL {
            let template = store.get(mode);
            assert_eq!(template.mode(), mode);
            assert!(template.missing_nodes(true).is_empty(), "{mode} template incomplete");
        }
    }

    #[test]
    fn builtin_templates_have_no_dangling_links() {
        let store = WorkflowTemplateStore::builtin().unwrap();
        for mode in GenerationMode::ALL {
            store.get(mode).graph().validate().unwrap();
        }
    }

    #[test]
    fn cloned_loader_ids_do_not_collide() {
        let store = WorkflowTemplateStore::builtin().unwrap();
        let graph = store.get(GenerationMode::Edit).graph();
        for offset in 1..=3 {
            assert!(!graph.contains(&(CLONED_LOADER_OFFSET + offset).to_string()));
        }
    }

    #[test]
    fn output_node_depends_on_extend() {
        assert_eq!(output_node(GenerationMode::Edit, false), "79");
        assert_eq!(output_node(GenerationMode::Video, false), video_nodes::SAVE);
        assert_eq!(output_node(GenerationMode::Video, true), video_nodes::SAVE_EXTENDED);
    }

    #[test]
    fn save_nodes_map_to_saving_phase() {
        assert_eq!(
            phase_for_node(GenerationMode::Edit, edit_nodes::SAVE),
            Some(Phase::Saving)
        );
        assert_eq!(
            phase_for_node(GenerationMode::Generate, generate_nodes::SAMPLER),
            Some(Phase::Generating)
        );
        assert_eq!(phase_for_node(GenerationMode::Generate, "9999"), None);
    }

    #[test]
    fn override_directory_replaces_one_template() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("generate.json"),
            r#"{"9": {"class_type": "SaveImage", "inputs": {"images": ["9", 0]}}}"#,
        )
        .unwrap();

        let store = WorkflowTemplateStore::with_overrides(dir.path()).unwrap();
        assert_eq!(store.get(GenerationMode::Generate).graph().len(), 1);
        assert!(!store.get(GenerationMode::Generate).missing_nodes(false).is_empty());
        assert!(store.get(GenerationMode::Edit).missing_nodes(false).is_empty());
    }

    #[test]
    fn unreadable_override_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("edit.json"), "[not a graph").unwrap();
        assert!(matches!(
            WorkflowTemplateStore::with_overrides(dir.path()),
            Err(StudioError::Configuration(_))
        ));
    }
}
