use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use adaptive_control_models::{Message, UnknownToken};
use minijinja::{context, Environment};
use serde::Deserialize;

use crate::engine::SamplingParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFamily {
    Llama,
    Qwen,
    Mistral,
    Unknown,
}

const LLAMA_TEMPLATE: &str = "<|begin_of_text|>{% for m in messages %}<|start_header_id|>{{ m.role }}<|end_header_id|>\n\n{{ m.content }}<|eot_id|>{% endfor %}{% if add_generation_prompt %}<|start_header_id|>assistant<|end_header_id|>\n\n{% endif %}";

const QWEN_TEMPLATE: &str = "{% for m in messages %}<|im_start|>{{ m.role }}\n{{ m.content }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

const MISTRAL_TEMPLATE: &str = "<s>{% for m in messages %}{% if m.role == 'user' %}[INST] {{ m.content }} [/INST]{% elif m.role == 'assistant' %}{{ m.content }}</s>{% else %}[INST] [SYSTEM] {{ m.content }} [/SYSTEM] [/INST]{% endif %}{% endfor %}";

const PLAIN_TEMPLATE: &str = "{% for m in messages %}\n[{{ m.role }}]\n{{ m.content }}\n[/{{ m.role }}]\n{% endfor %}{% if add_generation_prompt %}\n[assistant]\n{% endif %}";

impl PromptFamily {
    pub fn infer_from_filename(name: &str) -> Self {
        let lowered = name.to_lowercase();
        if lowered.contains("llama") {
            Self::Llama
        } else if lowered.contains("qwen") {
            Self::Qwen
        } else if lowered.contains("mistral") || lowered.contains("mixtral") {
            Self::Mistral
        } else {
            Self::Unknown
        }
    }

    fn chat_template(self) -> &'static str {
        match self {
            Self::Llama => LLAMA_TEMPLATE,
            Self::Qwen => QWEN_TEMPLATE,
            Self::Mistral => MISTRAL_TEMPLATE,
            Self::Unknown => PLAIN_TEMPLATE,
        }
    }
}

impl fmt::Display for PromptFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Llama => "llama",
            Self::Qwen => "qwen",
            Self::Mistral => "mistral",
            Self::Unknown => "unknown",
        })
    }
}

impl FromStr for PromptFamily {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llama" => Ok(Self::Llama),
            "qwen" => Ok(Self::Qwen),
            "mistral" => Ok(Self::Mistral),
            "unknown" => Ok(Self::Unknown),
            _ => Err(UnknownToken::new("prompt family", s, "llama, qwen, mistral, unknown")),
        }
    }
}

/// Renders role-tagged turns into the family's chat format, ending with an
/// open assistant turn.
pub fn render_chat(family: PromptFamily, messages: &[Message]) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("chat", family.chat_template())?;
    env.get_template("chat")?.render(context! {
        messages => messages,
        add_generation_prompt => true,
    })
}

/// Effective parameters of one generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
    pub max_new_tokens: usize,
}

impl GenerationParams {
    /// Temperature 0 selects greedy decoding.
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            max_new_tokens: self.max_new_tokens,
            temperature: (self.temperature > 0.0).then_some(self.temperature),
            top_p: (self.top_p < 1.0).then_some(self.top_p),
        }
    }
}

/// Splits a `key=value` payload separated by `,` or `;` into a map.
pub fn parse_override_payload(payload: &str) -> Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();

    for pair in payload.split([',', ';']) {
        let item = pair.trim();
        if item.is_empty() {
            continue;
        }

        let mut it = item.splitn(2, '=');
        let key = it.next().unwrap_or("").trim().to_lowercase();
        let value = it
            .next()
            .ok_or_else(|| format!("Invalid item '{}'. Expected key=value", item))?
            .trim();
        out.insert(key, value.to_string());
    }

    Ok(out)
}

/// Merges per-call overrides over `base`, validating each value.
pub fn apply_generation_overrides(
    overrides: &BTreeMap<String, String>,
    base: GenerationParams,
) -> Result<GenerationParams, String> {
    let mut cfg = base;

    for (key, value) in overrides {
        let value = value.trim();
        match key.as_str() {
            "temperature" | "temp" => {
                let parsed: f64 = value
                    .parse()
                    .map_err(|_| format!("Invalid temperature '{}'.", value))?;
                if !(0.0..=2.0).contains(&parsed) {
                    return Err("temperature must be in [0.0, 2.0]".to_string());
                }
                cfg.temperature = parsed;
            }
            "top_p" | "topp" => {
                let parsed: f64 = value
                    .parse()
                    .map_err(|_| format!("Invalid top_p '{}'.", value))?;
                if !(0.0..=1.0).contains(&parsed) {
                    return Err("top_p must be in [0.0, 1.0]".to_string());
                }
                cfg.top_p = parsed;
            }
            "seed" => {
                cfg.seed = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid seed '{}'.", value))?,
                );
            }
            "max_tokens" | "max_new_tokens" => {
                let parsed: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid max_new_tokens '{}'.", value))?;
                if parsed == 0 {
                    return Err("max_new_tokens must be > 0".to_string());
                }
                cfg.max_new_tokens = parsed;
            }
            _ => return Err(format!("Unknown generation key '{}'.", key)),
        }
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> GenerationParams {
        GenerationParams {
            temperature: 0.7,
            top_p: 0.9,
            seed: None,
            max_new_tokens: 512,
        }
    }

    #[test]
    fn family_inference_from_name() {
        assert_eq!(PromptFamily::infer_from_filename("Meta-Llama-3-8B"), PromptFamily::Llama);
        assert_eq!(PromptFamily::infer_from_filename("Qwen2.5-7B-Instruct-Q4_K_M"), PromptFamily::Qwen);
        assert_eq!(PromptFamily::infer_from_filename("Mixtral-8x7B"), PromptFamily::Mistral);
        assert_eq!(PromptFamily::infer_from_filename("phi-3"), PromptFamily::Unknown);
    }

    #[test]
    fn qwen_template_opens_assistant_turn() {
        let prompt = render_chat(
            PromptFamily::Qwen,
            &[Message::system("be brief"), Message::user("hi")],
        )
        .expect("render qwen");
        assert_eq!(
            prompt,
            "<|im_start|>system\nbe brief<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn llama_template_uses_header_tokens() {
        let prompt = render_chat(PromptFamily::Llama, &[Message::user("hello")]).expect("render llama");
        assert!(prompt.starts_with("<|begin_of_text|><|start_header_id|>user<|end_header_id|>"));
        assert!(prompt.contains("hello<|eot_id|>"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn templates_do_not_escape_markup() {
        let prompt = render_chat(PromptFamily::Unknown, &[Message::user("a < b && c")]).expect("render");
        assert!(prompt.contains("a < b && c"));
    }

    #[test]
    fn overrides_merge_over_base() {
        let map = parse_override_payload("temperature=0.2; seed=42, max_new_tokens=64").expect("payload");
        let merged = apply_generation_overrides(&map, base()).expect("merge");
        assert_eq!(merged.temperature, 0.2);
        assert_eq!(merged.top_p, 0.9);
        assert_eq!(merged.seed, Some(42));
        assert_eq!(merged.max_new_tokens, 64);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        assert!(parse_override_payload("temperature").is_err());

        let cases = [
            ("temperature", "3.5"),
            ("top_p", "-0.1"),
            ("seed", "abc"),
            ("max_new_tokens", "0"),
            ("beam_width", "4"),
        ];
        for (key, value) in cases {
            let map = BTreeMap::from([(key.to_string(), value.to_string())]);
            assert!(
                apply_generation_overrides(&map, base()).is_err(),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let params = GenerationParams {
            temperature: 0.0,
            top_p: 1.0,
            ..base()
        };
        let sampling = params.sampling();
        assert_eq!(sampling.temperature, None);
        assert_eq!(sampling.top_p, None);
        assert_eq!(sampling.max_new_tokens, 512);
    }
}
