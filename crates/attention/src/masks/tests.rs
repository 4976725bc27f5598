use super::*;
use candle_core::{Device, Result, Tensor};

fn rows(mask: &Tensor) -> Result<Vec<Vec<f32>>> {
    let (_, _, _, k_len) = mask.dims4()?;
    Ok(mask
        .flatten_all()?
        .to_vec1::<f32>()?
        .chunks(k_len)
        .map(|c| c.to_vec())
        .collect())
}

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let mask = build_causal_mask(&Device::Cpu, 2, 3, 5)?;
    assert_eq!(mask.dims(), &[2, 1, 3, 5]);
    let rows = rows(&mask)?;

    // Earliest query can only see the prefix (offset = k_len - q_len).
    assert_eq!(rows[0][2], 0.0);
    assert_eq!(rows[0][3], f32::NEG_INFINITY);
    // Last query sees everything.
    assert!(rows[2].iter().all(|v| *v == 0.0));
    // Second batch row repeats the first.
    assert_eq!(rows[3], rows[0]);
    Ok(())
}

#[test]
fn square_causal_mask_is_lower_triangular() -> Result<()> {
    let rows = rows(&build_causal_mask(&Device::Cpu, 1, 4, 4)?)?;
    for (q, row) in rows.iter().enumerate() {
        for (k, value) in row.iter().enumerate() {
            assert_eq!(*value == 0.0, k <= q, "q={q} k={k}");
        }
    }
    Ok(())
}

#[test]
fn segment_mask_blocks_cross_document_attention() -> Result<()> {
    let segments = Tensor::new(&[[1u32, 1, 2, 0]], &Device::Cpu)?;
    let mask = build_segment_mask(&segments, &segments)?;
    let rows = rows(&mask)?;
    assert_eq!(rows[0], vec![0.0, 0.0, f32::NEG_INFINITY, f32::NEG_INFINITY]);
    assert_eq!(rows[2][2], 0.0);
    assert_eq!(rows[2][0], f32::NEG_INFINITY);
    // Padding only sees padding.
    assert_eq!(rows[3], vec![f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY, 0.0]);
    Ok(())
}

#[test]
fn combined_mask_keeps_intersection() -> Result<()> {
    let device = Device::Cpu;
    let causal = build_causal_mask(&device, 1, 3, 3)?;
    let segments = Tensor::new(&[[1u32, 2, 2]], &device)?;
    let segment = build_segment_mask(&segments, &segments)?;
    let rows = rows(&combine_masks(&causal, Some(&segment))?)?;
    assert_eq!(rows[2], vec![f32::NEG_INFINITY, 0.0, 0.0]);
    assert_eq!(rows[1], vec![f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY]);
    Ok(())
}

#[test]
fn segment_mask_rejects_batch_mismatch() -> Result<()> {
    let q = Tensor::new(&[[1u32]], &Device::Cpu)?;
    let k = Tensor::new(&[[1u32], [1]], &Device::Cpu)?;
    assert!(build_segment_mask(&q, &k).is_err());
    Ok(())
}
