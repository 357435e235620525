//! Parallel Sort Demo
//!
//! Sorts random keys through the radix sort engine on the simulated device,
//! in direct and indirect mode, and compares against the host reference
//! radix sort and `sort_unstable`.

use parallel_sort::{cpu_radix_sort, CpuDevice, Device, ParallelSort, SortConfig, SortError};
use rand::Rng;
use std::time::{Duration, Instant};

/// Default array size for benchmarking
const DEFAULT_ARRAY_SIZE: usize = 1 << 20;

struct Options {
    num_keys: usize,
    payload: bool,
    benchmark: bool,
}

impl Options {
    fn parse() -> Self {
        let mut options = Options {
            num_keys: DEFAULT_ARRAY_SIZE,
            payload: false,
            benchmark: false,
        };
        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--payload" => options.payload = true,
                "--benchmark" => options.benchmark = true,
                other => match other.parse() {
                    Ok(n) => options.num_keys = n,
                    Err(_) => log::warn!("ignoring unrecognized argument {other:?}"),
                },
            }
        }
        options
    }
}

struct SortRun {
    keys: Vec<u32>,
    payload: Option<Vec<u32>>,
    duration: Duration,
}

/// Upload, sort on the device, read back. Only the submit is timed.
fn device_sort(
    config: &SortConfig,
    data: &[u32],
    payload: Option<&[u32]>,
    indirect: bool,
) -> Result<SortRun, SortError> {
    let mut device = CpuDevice::new();
    let n = data.len() as u32;
    let engine = ParallelSort::init(&mut device, n.max(1), payload.is_some(), indirect, config)?;

    let keys = device.create_buffer_init("keys", data)?;
    let values = payload
        .map(|p| device.create_buffer_init("payload", p))
        .transpose()?;

    let mut cmd = device.create_command_list();
    if indirect {
        let count = device.create_buffer_init("num keys", &[n])?;
        engine.execute_indirect(&mut cmd, count, keys, values)?;
    } else {
        engine.execute(&mut cmd, n, keys, values)?;
    }

    let start = Instant::now();
    let submitted = device.submit(cmd);
    let duration = start.elapsed();

    let result = submitted.map_err(SortError::from).and_then(|()| {
        let keys = device.read_buffer(keys, 0, data.len())?;
        let payload = values
            .map(|v| device.read_buffer(v, 0, data.len()))
            .transpose()?;
        Ok(SortRun {
            keys,
            payload,
            duration,
        })
    });

    log::debug!("device stats: {:?}", device.stats());
    engine.destroy(&mut device);
    result
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn report_run(name: &str, run: &Result<SortRun, SortError>, expected: &[u32], pairs: Option<&[u32]>) {
    match run {
        Ok(run) => {
            println!("{} sort time: {:.3} ms", name, millis(run.duration));
            if run.keys != expected {
                println!("ERROR: {} sort failed verification!", name);
                return;
            }
            match (&run.payload, pairs) {
                (Some(payload), Some(reference)) if payload != reference => {
                    println!("ERROR: {} payload does not follow its keys!", name)
                }
                _ => println!("{} sort verified: OK", name),
            }
        }
        Err(e) => println!("{} sort error: {}", name, e),
    }
}

fn main() {
    env_logger::init();
    let options = Options::parse();
    let config = SortConfig::from_env();

    println!("Parallel Radix Sort");
    println!("===================\n");
    println!(
        "Array size: {} elements ({} MB), payload: {}, thread-group budget: {}",
        options.num_keys,
        options.num_keys * 4 / 1_000_000,
        if options.payload { "yes" } else { "no" },
        config.max_thread_groups
    );

    println!("\nGenerating random data...");
    let mut rng = rand::thread_rng();
    let data: Vec<u32> = (0..options.num_keys).map(|_| rng.gen()).collect();
    let payload: Option<Vec<u32>> = options
        .payload
        .then(|| (0..options.num_keys as u32).collect());

    println!("\n--- CPU Sorting (std::sort unstable / pdqsort) ---");
    let mut std_data = data.clone();
    let std_start = Instant::now();
    std_data.sort_unstable();
    let std_duration = std_start.elapsed();
    println!("CPU sort time: {:.3} ms", millis(std_duration));

    println!("\n--- CPU Sorting (4-bit LSD radix sort) ---");
    let radix_start = Instant::now();
    let (reference_keys, reference_payload) = match &payload {
        Some(values) => {
            let (keys, values) = cpu_radix_sort::sort_pairs(&data, values);
            (keys, Some(values))
        }
        None => {
            let mut keys = data.clone();
            cpu_radix_sort::sort(&mut keys);
            (keys, None)
        }
    };
    let radix_duration = radix_start.elapsed();
    println!("CPU radix sort time: {:.3} ms", millis(radix_duration));
    if reference_keys != std_data {
        println!("ERROR: CPU radix sort disagrees with std sort!");
    }

    println!("\n--- Device Sorting (direct dispatch) ---");
    let direct = device_sort(&config, &data, payload.as_deref(), false);
    report_run("Direct", &direct, &std_data, reference_payload.as_deref());

    println!("\n--- Device Sorting (indirect dispatch) ---");
    let indirect = device_sort(&config, &data, payload.as_deref(), true);
    report_run("Indirect", &indirect, &std_data, reference_payload.as_deref());

    if let (Ok(direct), Ok(indirect)) = (&direct, &indirect) {
        if direct.keys == indirect.keys && direct.payload == indirect.payload {
            println!("\nDirect and indirect results match: OK");
        } else {
            println!("\nWARNING: Direct and indirect results differ!");
        }
    }

    println!("\n--- Performance Comparison ---");
    let cpu_ms = millis(std_duration);
    for (name, run) in [("Direct", &direct), ("Indirect", &indirect)] {
        if let Ok(run) = run {
            let speedup = cpu_ms / millis(run.duration);
            if speedup > 1.0 {
                println!("{} vs CPU: device is {:.2}x faster", name, speedup);
            } else {
                println!("{} vs CPU: CPU is {:.2}x faster", name, 1.0 / speedup);
            }
        }
    }

    if options.benchmark {
        run_benchmark(&config);
    }
}

/// Run benchmarks across multiple array sizes
fn run_benchmark(config: &SortConfig) {
    println!("\n\n====================================");
    println!("Running comprehensive benchmark...");
    println!("====================================\n");

    let sizes: Vec<usize> = vec![
        1 << 10, // 1K
        1 << 12, // 4K
        1 << 14, // 16K
        1 << 16, // 64K
        1 << 18, // 256K
        1 << 20, // 1M
        1 << 22, // 4M
    ];

    println!(
        "{:>12} | {:>12} | {:>12} | {:>12} | {:>12} | {:>12}",
        "Size", "CPU (ms)", "Radix (ms)", "Direct (ms)", "Indirect", "Direct/CPU"
    );
    println!(
        "{:-<12}-+-{:-<12}-+-{:-<12}-+-{:-<12}-+-{:-<12}-+-{:-<12}",
        "", "", "", "", "", ""
    );

    let mut rng = rand::thread_rng();

    for &size in &sizes {
        let data: Vec<u32> = (0..size).map(|_| rng.gen()).collect();

        let mut cpu_data = data.clone();
        let cpu_start = Instant::now();
        cpu_data.sort_unstable();
        let cpu_ms = millis(cpu_start.elapsed());

        let mut radix_data = data.clone();
        let radix_start = Instant::now();
        cpu_radix_sort::sort(&mut radix_data);
        let radix_ms = millis(radix_start.elapsed());

        let timed = |indirect: bool| match device_sort(config, &data, None, indirect) {
            Ok(run) if run.keys == cpu_data => Some(millis(run.duration)),
            _ => None,
        };
        let direct_ms = timed(false);
        let indirect_ms = timed(true);

        let format_ms = |ms: Option<f64>| ms.map_or("ERROR".to_string(), |ms| format!("{:.3}", ms));
        let speedup = direct_ms.map_or("N/A".to_string(), |ms| format!("{:.2}x", cpu_ms / ms));

        println!(
            "{:>12} | {:>12.3} | {:>12.3} | {:>12} | {:>12} | {:>12}",
            size,
            cpu_ms,
            radix_ms,
            format_ms(direct_ms),
            format_ms(indirect_ms),
            speedup
        );
    }

    println!("\nNote: Speedup > 1.0x means the device sort is faster than CPU");
    println!("      Speedup < 1.0x means CPU is faster than the device sort");
}
