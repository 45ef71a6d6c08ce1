// gallium/renderer/src/shader.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shaders and their compiled variants.
//!
//! The compiler is an outside service. A shader compiles lazily into one variant per distinct
//! `CompileKey`; a variant that fails to compile or does not fit the hardware budget is replaced
//! by a fallback so that drawing never fails because of a shader.

use fxhash::FxHashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_SHADER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_VARIANT_ID: AtomicU64 = AtomicU64::new(1);

/// The color fallback fragment shaders write.
pub const FALLBACK_COLOR: [f32; 4] = [1.0, 0.0, 0.0, 1.0];

const FALLBACK_FS_TOKENS: [u32; 2] = [0xfa11_0001, 0x3f80_0000];
const PASSTHROUGH_VS_TOKENS: [u32; 2] = [0xfa11_0002, 0];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Pipeline state that changes the generated code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CompileKey {
    pub light_twoside: bool,
    pub flat_shade: bool,
    pub sprite_coord_enable: u8,
    /// Samplers addressed with unnormalized (texel) coordinates.
    pub unnormalized_coords: u16,
    /// Samplers doing shadow comparison.
    pub shadow_compare: u16,
    /// Fetch position and varyings already transformed on the CPU.
    pub passthrough: bool,
    /// Produce code the CPU runs rather than hardware tokens.
    pub cpu: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResourceUsage {
    pub num_instructions: u32,
    pub num_temps: u32,
}

/// What a device can run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShaderLimits {
    pub max_instructions: u32,
    pub max_temps: u32,
    pub max_token_dwords: usize,
}

impl ShaderLimits {
    pub fn unlimited() -> ShaderLimits {
        ShaderLimits {
            max_instructions: u32::MAX,
            max_temps: u32::MAX,
            max_token_dwords: usize::MAX,
        }
    }

    fn admits(&self, compiled: &CompiledShader) -> bool {
        let tokens_fit = match compiled.code {
            ShaderCode::Tokens(ref tokens) => tokens.len() <= self.max_token_dwords,
            ShaderCode::Jit(_) => true,
        };
        tokens_fit &&
            compiled.usage.num_instructions <= self.max_instructions &&
            compiled.usage.num_temps <= self.max_temps
    }
}

/// A program the CPU executes, for software rendering and software vertex processing.
pub trait CpuProgram: Send + Sync {
    /// The number of `[f32; 4]` registers `run()` writes.
    fn num_outputs(&self) -> usize;

    /// Runs one invocation. Vertex programs write the clip-space position to `outputs[0]`;
    /// fragment programs write one color per render target. Returning false discards the
    /// fragment.
    fn run(&self,
           inputs: &[[f32; 4]],
           constants: &[[f32; 4]],
           front_facing: bool,
           outputs: &mut [[f32; 4]])
           -> bool;
}

pub enum ShaderCode {
    Tokens(Vec<u32>),
    Jit(Arc<dyn CpuProgram>),
}

impl Debug for ShaderCode {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        match *self {
            ShaderCode::Tokens(ref tokens) => write!(formatter, "Tokens({} dwords)", tokens.len()),
            ShaderCode::Jit(ref program) => {
                write!(formatter, "Jit({} outputs)", program.num_outputs())
            }
        }
    }
}

#[derive(Debug)]
pub struct CompiledShader {
    pub code: ShaderCode,
    pub usage: ResourceUsage,
}

pub trait ShaderCompiler: Send + Sync {
    fn compile(&self, stage: ShaderStage, tokens: &[u32], key: &CompileKey)
               -> Result<CompiledShader, String>;
}

#[derive(Debug)]
pub struct ShaderVariant {
    id: u64,
    stage: ShaderStage,
    key: CompileKey,
    code: ShaderCode,
    usage: ResourceUsage,
    is_fallback: bool,
}

impl ShaderVariant {
    fn new(stage: ShaderStage, key: CompileKey, compiled: CompiledShader, is_fallback: bool)
           -> ShaderVariant {
        ShaderVariant {
            id: NEXT_VARIANT_ID.fetch_add(1, Ordering::Relaxed),
            stage,
            key,
            code: compiled.code,
            usage: compiled.usage,
            is_fallback,
        }
    }

    /// A constant red fragment shader, or a vertex shader that passes its inputs through.
    pub fn fallback(stage: ShaderStage, key: CompileKey) -> ShaderVariant {
        let code = match (stage, key.cpu) {
            (ShaderStage::Fragment, true) => {
                ShaderCode::Jit(Arc::new(ConstantColorProgram { color: FALLBACK_COLOR }))
            }
            (ShaderStage::Fragment, false) => ShaderCode::Tokens(FALLBACK_FS_TOKENS.to_vec()),
            (ShaderStage::Vertex, true) => {
                ShaderCode::Jit(Arc::new(PassthroughProgram { num_outputs: 1 }))
            }
            (ShaderStage::Vertex, false) => ShaderCode::Tokens(PASSTHROUGH_VS_TOKENS.to_vec()),
        };
        let usage = ResourceUsage { num_instructions: 1, num_temps: 0 };
        ShaderVariant::new(stage, key, CompiledShader { code, usage }, true)
    }

    /// The hardware vertex shader used for vertices transformed on the CPU.
    pub fn passthrough_vs(num_outputs: usize) -> ShaderVariant {
        let mut tokens = PASSTHROUGH_VS_TOKENS.to_vec();
        tokens[1] = num_outputs as u32;
        let key = CompileKey { passthrough: true, ..CompileKey::default() };
        let code = ShaderCode::Tokens(tokens);
        let usage = ResourceUsage { num_instructions: num_outputs as u32, num_temps: 0 };
        ShaderVariant::new(ShaderStage::Vertex, key, CompiledShader { code, usage }, false)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    #[inline]
    pub fn key(&self) -> &CompileKey {
        &self.key
    }

    #[inline]
    pub fn usage(&self) -> ResourceUsage {
        self.usage
    }

    #[inline]
    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }

    #[inline]
    pub fn tokens(&self) -> &[u32] {
        match self.code {
            ShaderCode::Tokens(ref tokens) => tokens,
            ShaderCode::Jit(_) => &[],
        }
    }

    #[inline]
    pub fn cpu_program(&self) -> Option<&Arc<dyn CpuProgram>> {
        match self.code {
            ShaderCode::Jit(ref program) => Some(program),
            ShaderCode::Tokens(_) => None,
        }
    }
}

/// A shader as handed over by the state tracker, with its compiled variants.
pub struct Shader {
    id: u64,
    stage: ShaderStage,
    tokens: Vec<u32>,
    variants: Mutex<FxHashMap<CompileKey, Arc<ShaderVariant>>>,
}

impl Shader {
    pub fn new(stage: ShaderStage, tokens: Vec<u32>) -> Shader {
        Shader {
            id: NEXT_SHADER_ID.fetch_add(1, Ordering::Relaxed),
            stage,
            tokens,
            variants: Mutex::new(FxHashMap::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    #[inline]
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn variant_count(&self) -> usize {
        self.variants.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns the variant for `key`, compiling it on first use.
    pub fn get_or_compile(&self,
                          compiler: &dyn ShaderCompiler,
                          key: &CompileKey,
                          limits: &ShaderLimits)
                          -> Arc<ShaderVariant> {
        let mut variants = self.variants.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(variant) = variants.get(key) {
            return variant.clone();
        }

        let variant = match compiler.compile(self.stage, &self.tokens, key) {
            Ok(compiled) => {
                let runnable = match compiled.code {
                    ShaderCode::Tokens(_) => !key.cpu,
                    ShaderCode::Jit(_) => key.cpu,
                };
                if !runnable {
                    warn!("shader {} compiled to the wrong kind of code ({:?}); using fallback",
                          self.id,
                          compiled.code);
                    ShaderVariant::fallback(self.stage, *key)
                } else if !limits.admits(&compiled) {
                    warn!("shader {} exceeds the hardware budget ({:?}); using fallback",
                          self.id,
                          compiled.usage);
                    ShaderVariant::fallback(self.stage, *key)
                } else {
                    ShaderVariant::new(self.stage, *key, compiled, false)
                }
            }
            Err(message) => {
                warn!("shader {} failed to compile ({}); using fallback", self.id, message);
                ShaderVariant::fallback(self.stage, *key)
            }
        };

        debug!("shader {} variant {} for {:?}", self.id, variant.id, key);
        let variant = Arc::new(variant);
        variants.insert(*key, variant.clone());
        variant
    }
}

/// Copies inputs to outputs.
pub struct PassthroughProgram {
    pub num_outputs: usize,
}

impl CpuProgram for PassthroughProgram {
    fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    fn run(&self, inputs: &[[f32; 4]], _: &[[f32; 4]], _: bool, outputs: &mut [[f32; 4]])
           -> bool {
        for (output, input) in outputs.iter_mut().zip(inputs.iter()) {
            *output = *input;
        }
        true
    }
}

pub struct ConstantColorProgram {
    pub color: [f32; 4],
}

impl CpuProgram for ConstantColorProgram {
    fn num_outputs(&self) -> usize {
        1
    }

    fn run(&self, _: &[[f32; 4]], _: &[[f32; 4]], _: bool, outputs: &mut [[f32; 4]]) -> bool {
        for output in outputs.iter_mut() {
            *output = self.color;
        }
        true
    }
}
