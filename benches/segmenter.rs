//! Micro-benchmarks for text segmentation and halving.
//!
//! Run with: `cargo bench -- segment`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use qwen3_voiceclone::text::{split_in_half, Language, SegmenterConfig, TextSegmenter};
use std::hint::black_box;

const ENGLISH: &str = "The quick brown fox jumps over the lazy dog, twice. \
    Then, after a pause of 3.5 seconds, it does it again! Why? Nobody knows. ";
const JAPANESE: &str = "吾輩は猫である。名前はまだ無い。どこで生れたかとんと見当がつかぬ、\
    何でも薄暗いじめじめした所でニャーニャー泣いていた事だけは記憶している。";

fn corpus(paragraph: &str, chars: usize) -> String {
    paragraph.chars().cycle().take(chars).collect()
}

fn bench_segment(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment");

    for (name, paragraph, language) in [
        ("english", ENGLISH, Language::English),
        ("japanese", JAPANESE, Language::Japanese),
    ] {
        for chars in [1_000, 20_000] {
            let text = corpus(paragraph, chars);
            let segmenter = TextSegmenter::new(SegmenterConfig::default(), language);
            group.bench_with_input(
                BenchmarkId::new(name, chars),
                &text,
                |b, text| b.iter(|| segmenter.segment(black_box(text)).unwrap()),
            );
        }
    }
    group.finish();
}

fn bench_segment_lines(c: &mut Criterion) {
    let script: String = (0..500).map(|i| format!("Line number {i} of the script.\n")).collect();
    let segmenter = TextSegmenter::new(
        SegmenterConfig {
            split_lines: true,
            ..Default::default()
        },
        Language::English,
    );

    c.bench_function("segment_per_line_500", |b| {
        b.iter(|| segmenter.segment(black_box(&script)).unwrap());
    });
}

fn bench_split_in_half(c: &mut Criterion) {
    let text = corpus(ENGLISH, 180);
    c.bench_function("split_in_half_180", |b| {
        b.iter(|| split_in_half(black_box(&text), Language::English));
    });
}

criterion_group!(benches, bench_segment, bench_segment_lines, bench_split_in_half);
criterion_main!(benches);
