mod loading;

pub mod chat;
pub mod gemma3;
pub mod pipeline;
pub mod tokenizer;

use anyhow::Result;
use candle_core::Device;
use candle_core::utils::{cuda_is_available, metal_is_available};
use strum::{Display, EnumString};

pub use chat::{ChatMessage, ChatRole, ChatTemplate, ContentPart, LanguageCode};
pub use pipeline::{GenerateOptions, LoadOptions, PipelineError, VlmPipeline};
pub use tokenizer::ChatTokenizer;

/// Requested compute device. `Gpu` takes whichever accelerator is built in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeviceKind {
    #[default]
    Cpu,
    Gpu,
    Cuda,
    Metal,
}

pub fn device(kind: DeviceKind) -> Result<Device> {
    let device = match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => Device::new_cuda(0)?,
        DeviceKind::Metal => Device::new_metal(0)?,
        DeviceKind::Gpu if cuda_is_available() => Device::new_cuda(0)?,
        DeviceKind::Gpu if metal_is_available() => Device::new_metal(0)?,
        DeviceKind::Gpu => {
            anyhow::bail!("no GPU backend available, rebuild with the `cuda` or `metal` feature")
        }
    };
    tracing::info!(requested = %kind, device = ?device.location(), "using device");
    Ok(device)
}
