use std::time::Instant;

use spmv::{DeviceQueue, SparseMatrix, TransferStats};

/// Builds the 5-point Poisson operator on an m x m grid in CSR form.
fn poisson_csr(m: usize) -> (usize, Vec<u32>, Vec<u32>, Vec<f32>) {
    let n = m * m;
    let mut row_offsets = vec![0u32];
    let mut cols = Vec::new();
    let mut values = Vec::new();
    for i in 0..m {
        for j in 0..m {
            let row = i * m + j;
            let mut entries: Vec<(usize, f32)> = Vec::with_capacity(5);
            if i > 0 {
                entries.push((row - m, -1.0));
            }
            if j > 0 {
                entries.push((row - 1, -1.0));
            }
            entries.push((row, 4.0));
            if j + 1 < m {
                entries.push((row + 1, -1.0));
            }
            if i + 1 < m {
                entries.push((row + m, -1.0));
            }
            for (col, value) in entries {
                cols.push(col as u32);
                values.push(value);
            }
            row_offsets.push(cols.len() as u32);
        }
    }
    (n, row_offsets, cols, values)
}

#[tokio::main]
async fn main() {
    // Initialize logging based on RUST_LOG environment variable
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_module("wgpu", log::LevelFilter::Off)
        .init();

    let m = 256;
    let (n, row_offsets, cols, values) = poisson_csr(m);
    log::info!(
        "Assembled {m}x{m} Poisson grid: {n} unknowns, {} nonzeros",
        values.len()
    );

    // One host queue, plus a GPU queue when an adapter is around. The
    // throughput probe decides who gets how many rows.
    let mut queues = vec![DeviceQueue::host().expect("Failed to create host queue")];
    match DeviceQueue::gpu().await {
        Ok(queue) => {
            log::info!("Using GPU queue on '{}'", queue.context().name());
            queues.push(queue);
        }
        Err(e) => log::warn!("No usable GPU adapter, running host-only: {e}"),
    }

    let a = SparseMatrix::from_csr(&queues, n, &row_offsets, &cols, &values)
        .await
        .expect("Failed to build distributed matrix");

    log::info!("Row partition: {:?}", a.partition().bounds());
    for device in 0..a.device_count() {
        let report = a.device_report(device).expect("device report");
        log::info!(
            "  device {} [{:?}]: {} rows, {} local + {} remote nonzeros, sends {}, receives {}",
            report.device,
            report.backend,
            report.rows,
            report.local_nonzeros,
            report.remote_nonzeros,
            report.send_count,
            report.ghost_count,
        );
    }
    log::info!(
        "{} column(s) cross device boundaries per product",
        a.exchanged_columns()
    );

    let x_data: Vec<f32> = (0..n).map(|k| (k as f32 / n as f32).sin()).collect();
    let x = a.vector(&x_data).expect("Failed to upload x");
    let mut y = a.zero_vector().expect("Failed to allocate y");

    log::info!("Resetting transfer counters...");
    for queue in &queues {
        queue.context().reset_transfer_stats();
    }

    let rounds = 50;
    let start = Instant::now();
    for _ in 0..rounds {
        y.assign(&a * &x).await.expect("Product failed");
    }
    let result = y.read_to_vec().await.expect("Failed to read y back");
    let duration = start.elapsed();

    let norm = result
        .iter()
        .map(|v| f64::from(*v) * f64::from(*v))
        .sum::<f64>()
        .sqrt();
    let rate = rounds as f64 * a.nonzeros() as f64 / duration.as_secs_f64() / 1e6;
    log::info!("{rounds} products in {duration:?} ({rate:.2} Mnnz/s), |y| = {norm:.6}");

    for (device, queue) in queues.iter().enumerate() {
        let TransferStats {
            bytes_to_device,
            bytes_from_device,
        } = queue.context().transfer_stats();
        log::info!("  device {device} transfers: {bytes_to_device} B in, {bytes_from_device} B out");
    }
}
