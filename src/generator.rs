use crate::llm::{LlmError, PrimaryGenerator, PrimaryRequest, VariantGenerator, VariantRequest};
use crate::models::{ContentKind, GenerationOptions};
use std::{fmt::Write, sync::Arc};
use thiserror::Error;

pub const VARIANT_COUNT: u32 = 3;

const PRIMARY_MAX_TOKENS: u32 = 1000;
const PRIMARY_TEMPERATURE: f32 = 0.7;
const VARIANT_MAX_TOKENS: u32 = 500;
const VARIANT_TEMPERATURE: f32 = 0.9;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("primary generation failed: {0}")]
    Primary(#[source] LlmError),
    #[error("variant generation failed: {0}")]
    Variants(#[source] LlmError),
}

/// Primary text plus alternatives for one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedContent {
    pub primary: String,
    pub variants: Vec<String>,
}

impl GeneratedContent {
    pub fn render(&self) -> String {
        let mut out = format!("PRIMARY VERSION:\n{}\n\nVARIATIONS:", self.primary);
        for (idx, variant) in self.variants.iter().enumerate() {
            let _ = write!(out, "\n\nVARIATION {}:\n{}", idx + 1, variant.trim());
        }
        out
    }
}

#[derive(Clone)]
pub struct ContentGenerator {
    primary: Arc<dyn PrimaryGenerator>,
    variants: Arc<dyn VariantGenerator>,
}

impl ContentGenerator {
    pub fn new(primary: Arc<dyn PrimaryGenerator>, variants: Arc<dyn VariantGenerator>) -> Self {
        Self { primary, variants }
    }

    /// Runs both stages. A variant failure discards the primary text.
    pub async fn generate(
        &self,
        prompt: &str,
        kind: ContentKind,
        options: &GenerationOptions,
    ) -> Result<GeneratedContent, GenerationError> {
        let primary = self
            .primary
            .complete(PrimaryRequest {
                system: system_preamble(kind, options),
                prompt: prompt.to_string(),
                max_tokens: PRIMARY_MAX_TOKENS,
                temperature: PRIMARY_TEMPERATURE,
            })
            .await
            .map_err(GenerationError::Primary)?;

        let variants = self
            .variants
            .generate(VariantRequest {
                prompt: variant_prompt(&primary, kind),
                max_tokens: VARIANT_MAX_TOKENS,
                temperature: VARIANT_TEMPERATURE,
                num_generations: VARIANT_COUNT,
            })
            .await
            .map_err(GenerationError::Variants)?;

        Ok(GeneratedContent { primary, variants })
    }
}

pub fn system_preamble(kind: ContentKind, options: &GenerationOptions) -> String {
    let style = options.style.unwrap_or_default();
    let tone = options.tone.unwrap_or_default();
    let platform = options.platform.unwrap_or_default();
    let aspect = options.aspect_ratio.unwrap_or_default();

    let mut preamble = format!(
        "You are an expert e-commerce creative producer writing a {kind} for merchants.\n\
         Style: {style:?}. Tone: {tone:?}. Target platform: {platform:?}. Aspect ratio: {aspect}.",
        kind = kind.label(),
        aspect = aspect.as_str(),
    );
    if let Some(duration) = options.duration {
        let _ = write!(preamble, " Target length: {} seconds.", duration.seconds());
    }
    preamble.push_str(
        "\nKeep claims truthful, lead with the strongest product benefit and end with a clear call to action.",
    );
    preamble
}

pub fn variant_prompt(primary: &str, kind: ContentKind) -> String {
    format!(
        "Write {VARIANT_COUNT} alternative versions of the following {kind}. \
         Keep the same message but vary the hook, wording and structure.\n\n{primary}",
        kind = kind.label(),
    )
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Returns a fixed text, failing for prompts listed in `fail_on`.
    pub struct ScriptedPrimary {
        pub text: String,
        pub fail_on: HashSet<String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedPrimary {
        pub fn ok(text: &str) -> Self {
            Self {
                text: text.to_string(),
                fail_on: HashSet::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing_on(text: &str, prompts: &[&str]) -> Self {
            Self {
                fail_on: prompts.iter().map(|p| p.to_string()).collect(),
                ..Self::ok(text)
            }
        }
    }

    #[async_trait]
    impl PrimaryGenerator for ScriptedPrimary {
        async fn complete(&self, request: PrimaryRequest) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(request.prompt.clone());
            if self.fail_on.contains(&request.prompt) {
                return Err(LlmError::Http("HTTP 529 Overloaded".into()));
            }
            Ok(self.text.clone())
        }
    }

    pub struct ScriptedVariants {
        pub texts: Option<Vec<String>>,
        pub calls: Mutex<u32>,
    }

    impl ScriptedVariants {
        pub fn ok(texts: &[&str]) -> Self {
            Self {
                texts: Some(texts.iter().map(|t| t.to_string()).collect()),
                calls: Mutex::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                texts: None,
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl VariantGenerator for ScriptedVariants {
        async fn generate(&self, _request: VariantRequest) -> Result<Vec<String>, LlmError> {
            *self.calls.lock().unwrap() += 1;
            self.texts
                .clone()
                .ok_or_else(|| LlmError::Http("HTTP 500".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::{ScriptedPrimary, ScriptedVariants};
    use super::*;
    use crate::models::{AspectRatio, Style};

    #[tokio::test]
    async fn renders_primary_and_labeled_variants() {
        let generator = ContentGenerator::new(
            Arc::new(ScriptedPrimary::ok("PRIMARY")),
            Arc::new(ScriptedVariants::ok(&["V1", "V2", "V3"])),
        );
        let content = generator
            .generate("a", ContentKind::AdCopy, &GenerationOptions::default())
            .await
            .expect("generate");
        let text = content.render();
        assert!(text.starts_with("PRIMARY VERSION:\nPRIMARY"));
        assert!(text.contains("VARIATION 1:\nV1"));
        assert!(text.contains("VARIATION 2:\nV2"));
        assert!(text.contains("VARIATION 3:\nV3"));
    }

    #[tokio::test]
    async fn primary_failure_skips_variants() {
        let variants = Arc::new(ScriptedVariants::ok(&["V1"]));
        let generator = ContentGenerator::new(
            Arc::new(ScriptedPrimary::failing_on("P", &["boom"])),
            variants.clone(),
        );
        let err = generator
            .generate("boom", ContentKind::AdCopy, &GenerationOptions::default())
            .await
            .expect_err("primary fails");
        assert!(matches!(err, GenerationError::Primary(_)));
        assert_eq!(*variants.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn variant_failure_discards_primary() {
        let generator = ContentGenerator::new(
            Arc::new(ScriptedPrimary::ok("PRIMARY")),
            Arc::new(ScriptedVariants::failing()),
        );
        let err = generator
            .generate("a", ContentKind::SocialPost, &GenerationOptions::default())
            .await
            .expect_err("variants fail");
        assert!(matches!(err, GenerationError::Variants(_)));
    }

    #[test]
    fn preamble_uses_defaults_and_options() {
        let defaults = system_preamble(ContentKind::VideoScript, &GenerationOptions::default());
        assert!(defaults.contains("Style: Cinematic"));
        assert!(defaults.contains("Aspect ratio: 9:16"));

        let options = GenerationOptions {
            style: Some(Style::Minimal),
            aspect_ratio: Some(AspectRatio::Square),
            ..GenerationOptions::default()
        };
        let custom = system_preamble(ContentKind::VideoScript, &options);
        assert!(custom.contains("Style: Minimal"));
        assert!(custom.contains("Aspect ratio: 1:1"));
        assert!(custom.contains("short-form video script"));
    }
}
