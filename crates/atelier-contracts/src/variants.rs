use serde::{Deserialize, Serialize};

/// Which backend route family a variant submits through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRoute {
    /// `POST /api/generate/<variant>`
    Generate,
    /// `POST /api/jobs/<variant>`
    Jobs,
}

/// One generation variant: endpoint route plus the inputs it requires.
/// Variants share the submit/poll/resolve lifecycle; only the payload and
/// route differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantSpec {
    pub name: String,
    pub route: EndpointRoute,
    pub needs_prompt: bool,
    pub needs_source_image: bool,
}

impl VariantSpec {
    pub fn new(
        name: impl Into<String>,
        route: EndpointRoute,
        needs_prompt: bool,
        needs_source_image: bool,
    ) -> Self {
        Self {
            name: name.into(),
            route,
            needs_prompt,
            needs_source_image,
        }
    }

    pub fn endpoint_path(&self) -> String {
        match self.route {
            EndpointRoute::Generate => format!("/api/generate/{}", self.name),
            EndpointRoute::Jobs => format!("/api/jobs/{}", self.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VariantRegistry {
    variants: Vec<VariantSpec>,
}

impl VariantRegistry {
    pub fn new(variants: Vec<VariantSpec>) -> Self {
        Self { variants }
    }

    /// Registry of the generation surfaces the backend exposes.
    pub fn builtin() -> Self {
        Self::new(vec![
            VariantSpec::new("flux-kontext", EndpointRoute::Generate, true, true),
            VariantSpec::new("skin-enhancer", EndpointRoute::Generate, false, true),
            VariantSpec::new("text-to-image", EndpointRoute::Generate, true, false),
            VariantSpec::new("image-to-video", EndpointRoute::Jobs, true, true),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&VariantSpec> {
        let wanted = name.trim().to_ascii_lowercase();
        self.variants
            .iter()
            .find(|variant| variant.name == wanted)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names = self
            .variants
            .iter()
            .map(|variant| variant.name.clone())
            .collect::<Vec<String>>();
        names.sort();
        names
    }
}
