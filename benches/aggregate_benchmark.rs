use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use polyconnectome::meta::{MetaOptions, StudyMaps, aggregate_studies};
use polyconnectome::model::PcsModel;
use polyconnectome::shared::matrix::{upper_triangle_pairs, vector_length};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

fn random_symmetric(rng: &mut StdRng, n: usize, mut draw: impl FnMut(&mut StdRng) -> f64) -> Array2<f64> {
    let mut m = Array2::zeros((n, n));
    for (i, j) in upper_triangle_pairs(n) {
        let v = draw(rng);
        m[[i, j]] = v;
        m[[j, i]] = v;
    }
    m
}

fn random_cohort(regions: usize, studies: usize) -> Vec<StudyMaps> {
    let mut rng = StdRng::seed_from_u64(0x5EED_C55 + regions as u64);
    let effect = Normal::new(0.0, 0.5).unwrap();
    (0..studies)
        .map(|s| {
            let d = random_symmetric(&mut rng, regions, |r| effect.sample(r));
            let v = random_symmetric(&mut rng, regions, |r| r.gen_range(0.01..0.2));
            StudyMaps::new(format!("STUDY{s}"), d, v)
        })
        .collect()
}

fn benchmark_aggregate(c: &mut Criterion) {
    let options = MetaOptions::default();
    let mut group = c.benchmark_group("aggregate_studies");
    for &regions in &[34_usize, 68, 84] {
        let cohort = random_cohort(regions, 12);
        group.throughput(Throughput::Elements(vector_length(regions) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(regions), &cohort, |b, cohort| {
            b.iter(|| aggregate_studies(black_box(cohort), &options).unwrap())
        });
    }
    group.finish();
}

fn benchmark_evaluate(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(17);
    let regions = 84;
    let css = aggregate_studies(&random_cohort(regions, 4), &MetaOptions::default())
        .unwrap()
        .css;
    let model = PcsModel::from_css(css);
    let subject = random_symmetric(&mut rng, regions, |r| r.gen_range(-1.0..1.0));

    c.bench_function("evaluate_84_regions", |b| {
        b.iter(|| model.evaluate(black_box(subject.view())).unwrap())
    });
}

criterion_group!(benches, benchmark_aggregate, benchmark_evaluate);
criterion_main!(benches);
