/// FedAvg aggregation benchmarks
///
/// Benchmarks:
/// 1. aggregate_fit over the CIFAR CNN layout for growing client counts
/// 2. aggregate_fit over one large f64 tensor
///
/// Run with: cargo bench --bench aggregation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fedround_core::aggregator::aggregate_fit;
use fedround_core::protocol::{FitResult, Metrics};
use fedround_core::{DType, ModelSpec, ParameterSet, Tensor, TensorData};

fn results_for(model: &ModelSpec, clients: usize) -> Vec<FitResult> {
    (0..clients)
        .map(|i| FitResult {
            client_id: format!("client-{i:03}").into(),
            parameters: model.random_parameters(i as u64).expect("random parameters"),
            num_examples: 100 + i as u64,
            metrics: Metrics::new(),
        })
        .collect()
}

fn bench_cifar_cnn(c: &mut Criterion) {
    let model = ModelSpec::cifar_cnn();
    let mut group = c.benchmark_group("aggregate_fit_cifar_cnn");
    for clients in [2usize, 10, 50] {
        let results = results_for(&model, clients);
        let elements: usize = results.iter().map(|r| r.parameters.num_elements()).sum();
        group.throughput(Throughput::Elements(elements as u64));
        group.bench_with_input(BenchmarkId::from_parameter(clients), &results, |b, results| {
            b.iter(|| black_box(aggregate_fit(results).expect("aggregate")));
        });
    }
    group.finish();
}

fn bench_large_f64_tensor(c: &mut Criterion) {
    let len = 1 << 20;
    let results: Vec<FitResult> = (0..8)
        .map(|i| {
            let data = TensorData::from_f64(DType::F64, vec![i as f64; len]);
            let tensor = Tensor::new("dense", vec![len], data).expect("tensor");
            FitResult {
                client_id: format!("client-{i}").into(),
                parameters: ParameterSet::new(vec![tensor]),
                num_examples: 1 + i as u64,
                metrics: Metrics::new(),
            }
        })
        .collect();
    let mut group = c.benchmark_group("aggregate_fit_f64");
    group.throughput(Throughput::Elements((len * results.len()) as u64));
    group.sample_size(20);
    group.bench_function("8_clients_1m_elements", |b| {
        b.iter(|| black_box(aggregate_fit(&results).expect("aggregate")));
    });
    group.finish();
}

criterion_group!(benches, bench_cifar_cnn, bench_large_f64_tensor);
criterion_main!(benches);
