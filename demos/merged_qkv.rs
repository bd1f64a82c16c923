//! Adapted fused QKV projection walkthrough.
//!
//! This example demonstrates:
//! - Constructing attention blocks under a LoRA scope
//! - Marking only the low-rank factors as trainable
//! - Filtering the checkpoint key set
//! - Merging the update for inference and unmerging to resume training

use anyhow::Result;
use candle_core::{Device, Tensor};
use lora_rs::{
    lora_state_dict, mark_only_lora_as_trainable, AttentionConfig, BiasMode, CausalSelfAttention,
    LoraConfig, LoraScope, ParamSet,
};

fn main() -> Result<()> {
    println!("=== Merged QKV LoRA Example ===\n");

    let device = Device::Cpu;
    let attn_config = AttentionConfig {
        n_embd: 128,
        n_head: 4,
        bias: true,
    };
    let lora_config = LoraConfig {
        r: 8,
        alpha: 16.0,
        dropout: 0.0,
    };

    println!("LoRA Configuration:");
    println!("  Rank (r): {}", lora_config.r);
    println!("  Alpha: {}", lora_config.alpha);
    println!(
        "  Scaling factor: {}\n",
        lora_config.alpha / lora_config.r as f64
    );

    // Every attention block constructed while the scope is active gets the
    // adapted projection variant; the query and value partitions of the
    // fused QKV matrix carry the update, the key partition stays frozen.
    let mut blocks = Vec::new();
    {
        let _scope = LoraScope::enter(lora_config);
        for _ in 0..2 {
            blocks.push(CausalSelfAttention::new(&attn_config, &device)?);
        }
    }
    println!("Constructed {} adapted attention blocks", blocks.len());

    // Enumerate parameters and freeze everything except the LoRA factors.
    let mut params = ParamSet::new();
    for (idx, block) in blocks.iter().enumerate() {
        block.register_parameters(&format!("h.{idx}.attn"), &mut params);
    }
    mark_only_lora_as_trainable(&mut params, BiasMode::None);
    println!(
        "Parameters: {} registered, {} trainable elements",
        params.len(),
        params.num_trainable()
    );

    // The checkpoint keeps only the low-rank factors.
    let snapshot = lora_state_dict(&params, BiasMode::None);
    println!("Checkpoint keys ({}):", snapshot.len());
    for key in snapshot.keys() {
        println!("  {key}");
    }

    // Forward pass through the first block's fused projection.
    let input = Tensor::randn(0f32, 1f32, (1, 16, 128), &device)?;
    let (q, k, v) = blocks[0].qkv(&input)?;
    println!(
        "\nQKV shapes: q {:?}, k {:?}, v {:?}",
        q.dims(),
        k.dims(),
        v.dims()
    );

    // Fold the update into the frozen weights for inference, then back out.
    for block in &mut blocks {
        block.set_training(false)?;
    }
    println!("Merged for inference");
    for block in &mut blocks {
        block.set_training(true)?;
    }
    println!("Unmerged to resume training");

    println!("\n✓ Done");
    Ok(())
}
