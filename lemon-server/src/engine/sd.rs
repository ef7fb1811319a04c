//! sd-server engine: image generation, edits and variations.

use base64::Engine as _;
use serde_json::{json, Value};

use super::wrapped::{LaunchSpec, MultipartField, WrappedServer};
use super::{LoadContext, RecipeOptions, IMAGE_TIMEOUT_SECS};
use crate::backend::spec::spec_for_recipe;
use crate::error::{Error, Result};

use std::sync::Mutex;

pub struct SdServer {
    base: WrappedServer,
    /// Load-time sampler defaults, used when a request omits them.
    options: Mutex<RecipeOptions>,
}

impl SdServer {
    pub fn new(debug: bool, load_timeout_override: Option<u64>) -> Self {
        let spec = spec_for_recipe("sd-cpp").expect("sd-cpp spec is registered");
        Self {
            base: WrappedServer::new(spec, debug, load_timeout_override),
            options: Mutex::new(RecipeOptions::default()),
        }
    }

    pub fn base(&self) -> &WrappedServer {
        &self.base
    }

    pub async fn load(&self, ctx: &LoadContext) -> Result<()> {
        let main = ctx.require_main()?;
        tracing::info!(
            "Loading {} with sd-server, options: {}",
            ctx.model_name,
            ctx.options.to_log_string()
        );

        if main.is_dir() {
            return Err(Error::ModelNotFound(format!(
                "Model path is a directory, not a file: {}",
                main.display()
            )));
        }

        *self.options.lock().unwrap() = ctx.options.clone();

        let mut args = vec![
            "--listen-port".to_string(),
            "{port}".to_string(),
        ];

        // Split checkpoints (diffusion model + text encoder + VAE) use the
        // dedicated flags; single-file checkpoints load with -m.
        match (&ctx.text_encoder_path, &ctx.vae_path) {
            (Some(llm), Some(vae)) => {
                args.push("--diffusion-model".to_string());
                args.push(main.display().to_string());
                args.push("--llm".to_string());
                args.push(llm.display().to_string());
                args.push("--vae".to_string());
                args.push(vae.display().to_string());
            }
            _ => {
                args.push("-m".to_string());
                args.push(main.display().to_string());
            }
        }

        if self.base.is_debug() {
            args.push("-v".to_string());
        }

        self.base
            .launch(
                &ctx.backend,
                LaunchSpec {
                    exe_path: ctx.exe_path.clone(),
                    args,
                    env: Vec::new(),
                    filter_health_logs: false,
                },
            )
            .await
    }

    /// Sampler parameters ride inside the prompt as an
    /// `<sd_cpp_extra_args>` block; request values win over load-time
    /// defaults.
    fn extra_args(&self, request: &Value) -> Value {
        let options = self.options.lock().unwrap();
        let mut extra = json!({
            "steps": request
                .get("steps")
                .and_then(|v| v.as_u64())
                .unwrap_or_else(|| options.get_u64("steps", 20)),
            "cfg_scale": request
                .get("cfg_scale")
                .and_then(|v| v.as_f64())
                .unwrap_or_else(|| options.get_f64("cfg_scale", 1.0)),
        });
        if let Some(seed) = request.get("seed").and_then(|v| v.as_i64()) {
            extra["seed"] = json!(seed);
        }
        extra
    }

    fn prompt_with_extra_args(&self, prompt: &str, request: &Value) -> String {
        format!(
            "{prompt} <sd_cpp_extra_args>{}</sd_cpp_extra_args>",
            self.extra_args(request)
        )
    }

    pub async fn image_generations(&self, request: &Value) -> Result<Value> {
        let mut sd_request = request.clone();
        let prompt = request.get("prompt").and_then(|v| v.as_str()).unwrap_or("");
        sd_request["prompt"] = json!(self.prompt_with_extra_args(prompt, request));

        self.base
            .forward_request("/v1/images/generations", &sd_request, IMAGE_TIMEOUT_SECS)
            .await
    }

    pub async fn image_edits(&self, request: &Value) -> Result<Value> {
        let prompt = request.get("prompt").and_then(|v| v.as_str()).unwrap_or("");
        let mut fields = vec![
            MultipartField::text("prompt", self.prompt_with_extra_args(prompt, request)),
            MultipartField::text("n", request.get("n").and_then(|v| v.as_u64()).unwrap_or(1).to_string()),
        ];
        if let Some(size) = request.get("size").and_then(|v| v.as_str()) {
            fields.push(MultipartField::text("size", size));
        }

        if let Some(image) = decode_b64_field(request, "image_data")? {
            fields.push(MultipartField::file("image[]", image, "image.png", "image/png"));
        }
        if let Some(mask) = decode_b64_field(request, "mask_data")? {
            fields.push(MultipartField::file("mask", mask, "mask.png", "image/png"));
        }

        self.base
            .forward_multipart_request("/v1/images/edits", fields, IMAGE_TIMEOUT_SECS)
            .await
    }

    pub async fn image_variations(&self, request: &Value) -> Result<Value> {
        // Variations take no user prompt; the placeholder satisfies the
        // child's non-empty check.
        let mut fields = vec![
            MultipartField::text("prompt", "variation"),
            MultipartField::text("n", request.get("n").and_then(|v| v.as_u64()).unwrap_or(1).to_string()),
        ];
        if let Some(size) = request.get("size").and_then(|v| v.as_str()) {
            fields.push(MultipartField::text("size", size));
        }
        if let Some(image) = decode_b64_field(request, "image_data")? {
            fields.push(MultipartField::file("image[]", image, "image.png", "image/png"));
        }

        self.base
            .forward_multipart_request("/v1/images/edits", fields, IMAGE_TIMEOUT_SECS)
            .await
    }
}

fn decode_b64_field(request: &Value, key: &str) -> Result<Option<Vec<u8>>> {
    let Some(encoded) = request.get(key).and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map(Some)
        .map_err(|e| Error::InvalidRequest(format!("{key} is not valid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_prompt_embeds_extra_args() {
        let server = SdServer::new(false, None);
        let request = json!({"prompt": "a lighthouse", "steps": 8, "cfg_scale": 2.5, "seed": 42});
        let prompt = server.prompt_with_extra_args("a lighthouse", &request);

        assert!(prompt.starts_with("a lighthouse <sd_cpp_extra_args>"));
        assert!(prompt.ends_with("</sd_cpp_extra_args>"));

        let start = prompt.find("<sd_cpp_extra_args>").unwrap() + "<sd_cpp_extra_args>".len();
        let end = prompt.find("</sd_cpp_extra_args>").unwrap();
        let extra: Value = serde_json::from_str(&prompt[start..end]).unwrap();
        assert_eq!(extra["steps"], json!(8));
        assert_eq!(extra["cfg_scale"], json!(2.5));
        assert_eq!(extra["seed"], json!(42));
    }

    #[test]
    fn test_extra_args_fall_back_to_load_options() {
        let server = SdServer::new(false, None);
        let mut map = Map::new();
        map.insert("steps".into(), json!(30));
        *server.options.lock().unwrap() = RecipeOptions::new(map);

        let extra = server.extra_args(&json!({}));
        assert_eq!(extra["steps"], json!(30));
        // No seed key when the request omits it.
        assert!(extra.get("seed").is_none());
    }

    #[test]
    fn test_decode_b64_field() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"png-bytes");
        let request = json!({"image_data": encoded});
        let decoded = decode_b64_field(&request, "image_data").unwrap().unwrap();
        assert_eq!(decoded, b"png-bytes");

        assert!(decode_b64_field(&json!({}), "image_data").unwrap().is_none());
        assert!(decode_b64_field(&json!({"image_data": "!!"}), "image_data").is_err());
    }
}
