//! End-to-end checks that run the whole enhancement path (decode,
//! tensor conversion, generator forward pass, re-encode) in one piece.

use satsr_core::enhancer::Enhancer;
use satsr_core::generator::{zeroed_weights, UPSCALE};
use satsr_core::pipeline::{postprocess, preprocess, PixelBuffer};

fn gradient_image(width: u32, height: u32) -> PixelBuffer {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            data.push((x * 40 % 256) as u8);
            data.push((y * 40 % 256) as u8);
            data.push(((x + y) * 20 % 256) as u8);
        }
    }
    PixelBuffer::new(data, width, height).expect("gradient image")
}

#[test]
fn full_pipeline_upscales_by_four_in_each_dimension() {
    let enhancer = Enhancer::from_weights(&zeroed_weights()).expect("enhancer");
    let input = gradient_image(3, 2);

    let output = enhancer.enhance(&input).expect("enhance");
    assert_eq!(output.width, input.width * UPSCALE as u32);
    assert_eq!(output.height, input.height * UPSCALE as u32);
    assert_eq!(
        output.data.len(),
        (output.width * output.height * 3) as usize
    );
}

#[test]
fn full_pipeline_is_deterministic() {
    let enhancer = Enhancer::from_weights(&zeroed_weights()).expect("enhancer");
    let input = gradient_image(2, 2);

    let first = enhancer.enhance(&input).expect("first pass");
    let second = enhancer.enhance(&input).expect("second pass");
    assert_eq!(first.data, second.data);
}

#[test]
fn tensor_conversion_round_trip_is_lossless_to_within_one_count() {
    let input = gradient_image(5, 4);
    let restored = postprocess(&preprocess(&input)).expect("postprocess");

    assert_eq!(restored.width, input.width);
    assert_eq!(restored.height, input.height);
    for (&got, &want) in restored.data.iter().zip(input.data.iter()) {
        assert!(
            (i16::from(got) - i16::from(want)).abs() <= 1,
            "component drifted: {want} -> {got}"
        );
    }
}
