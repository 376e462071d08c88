use std::collections::BTreeSet;

use pollster::block_on;
use spmv::{DeviceQueue, Error, MatrixOptions, PartitionStrategy, SparseMatrix};

// Helper for float comparison in tests
fn assert_approx_eq_vec(a: &[f64], b: &[f64], tolerance: f64) {
    assert_eq!(a.len(), b.len(), "Vector lengths differ");
    for i in 0..a.len() {
        let diff = (a[i] - b[i]).abs();
        assert!(
            diff <= tolerance,
            "Verification failed at index {}: expected {}, got {}, diff {}",
            i,
            b[i],
            a[i],
            diff
        );
    }
}

fn host_queues(count: usize) -> Vec<DeviceQueue> {
    let _ = env_logger::builder().is_test(true).try_init();
    (0..count).map(|_| DeviceQueue::host().unwrap()).collect()
}

/// Seeded random square CSR matrix with a guaranteed diagonal.
fn random_csr(n: usize, max_extra: usize, seed: u64) -> (Vec<u32>, Vec<u32>, Vec<f64>) {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut row_offsets = vec![0u32];
    let mut cols = Vec::new();
    let mut values = Vec::new();
    for row in 0..n {
        let mut picked = BTreeSet::new();
        picked.insert(row);
        for _ in 0..rng.usize(..=max_extra) {
            picked.insert(rng.usize(..n));
        }
        for col in picked {
            cols.push(col as u32);
            values.push(rng.f64() * 2.0 - 1.0);
        }
        row_offsets.push(cols.len() as u32);
    }
    (row_offsets, cols, values)
}

fn random_vec(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..n).map(|_| rng.f64() * 2.0 - 1.0).collect()
}

fn reference_mul(
    n: usize,
    row_offsets: &[u32],
    cols: &[u32],
    values: &[f64],
    x: &[f64],
    alpha: f64,
) -> Vec<f64> {
    let mut y = vec![0.0; n];
    for row in 0..n {
        let span = row_offsets[row] as usize..row_offsets[row + 1] as usize;
        let mut sum = 0.0;
        for j in span {
            sum += values[j] * x[cols[j] as usize];
        }
        y[row] = alpha * sum;
    }
    y
}

#[test]
fn products_match_a_single_device_reference() -> Result<(), Error> {
    block_on(async {
        let n = 96;
        let (row_offsets, cols, values) = random_csr(n, 5, 11);
        let x_data = random_vec(n, 12);
        let expected = reference_mul(n, &row_offsets, &cols, &values, &x_data, 1.0);

        for devices in 1..=4 {
            let queues = host_queues(devices);
            let a = SparseMatrix::from_csr(&queues, n, &row_offsets, &cols, &values).await?;
            let x = a.vector(&x_data)?;
            let mut y = a.zero_vector()?;
            a.mul(&x, &mut y, 1.0, false).await?;
            assert_approx_eq_vec(&y.read_to_vec().await?, &expected, 1e-10);
        }
        Ok(())
    })
}

#[test]
fn explicit_bounds_may_leave_a_device_empty() -> Result<(), Error> {
    block_on(async {
        let n = 96;
        let (row_offsets, cols, values) = random_csr(n, 4, 21);
        let x_data = random_vec(n, 22);
        let expected = reference_mul(n, &row_offsets, &cols, &values, &x_data, 1.0);

        let queues = host_queues(3);
        let options = MatrixOptions {
            strategy: PartitionStrategy::Explicit(vec![0, 32, 32, 96]),
            ..MatrixOptions::default()
        };
        let a =
            SparseMatrix::from_csr_with(&queues, n, &row_offsets, &cols, &values, options).await?;
        assert_eq!(a.device_report(1).unwrap().rows, 0);

        let x = a.vector(&x_data)?;
        let mut y = a.zero_vector()?;
        a.mul(&x, &mut y, 1.0, false).await?;
        assert_approx_eq_vec(&y.read_to_vec().await?, &expected, 1e-10);
        Ok(())
    })
}

#[test]
fn append_accumulates_on_top_of_set() -> Result<(), Error> {
    block_on(async {
        let n = 64;
        let (row_offsets, cols, values) = random_csr(n, 4, 31);
        let x_data = random_vec(n, 32);
        let expected = reference_mul(n, &row_offsets, &cols, &values, &x_data, 2.0);

        let queues = host_queues(2);
        let a = SparseMatrix::from_csr(&queues, n, &row_offsets, &cols, &values).await?;
        let x = a.vector(&x_data)?;
        let mut y = a.zero_vector()?;
        a.mul(&x, &mut y, 1.0, false).await?;
        a.mul(&x, &mut y, 1.0, true).await?;
        assert_approx_eq_vec(&y.read_to_vec().await?, &expected, 1e-10);

        // A second set pass overwrites everything accumulated so far.
        a.mul(&x, &mut y, 1.0, false).await?;
        let expected = reference_mul(n, &row_offsets, &cols, &values, &x_data, 1.0);
        assert_approx_eq_vec(&y.read_to_vec().await?, &expected, 1e-10);
        Ok(())
    })
}

#[test]
fn alpha_scales_every_part_of_the_product() -> Result<(), Error> {
    block_on(async {
        let n = 48;
        let (row_offsets, cols, values) = random_csr(n, 3, 41);
        let x_data = random_vec(n, 42);
        let expected = reference_mul(n, &row_offsets, &cols, &values, &x_data, -2.5);

        let queues = host_queues(3);
        let a = SparseMatrix::from_csr(&queues, n, &row_offsets, &cols, &values).await?;
        let x = a.vector(&x_data)?;
        let mut y = a.zero_vector()?;
        a.mul(&x, &mut y, -2.5, false).await?;
        assert_approx_eq_vec(&y.read_to_vec().await?, &expected, 1e-10);
        Ok(())
    })
}

#[test]
fn block_diagonal_products_move_no_bytes() -> Result<(), Error> {
    block_on(async {
        // Two tridiagonal 4x4 blocks with no coupling between them.
        let row_offsets = vec![0u32, 2, 5, 8, 10, 12, 15, 18, 20];
        let cols = vec![
            0u32, 1, 0, 1, 2, 1, 2, 3, 2, 3, // block one
            4, 5, 4, 5, 6, 5, 6, 7, 6, 7, // block two
        ];
        let values: Vec<f64> = cols.iter().map(|&c| if c % 2 == 0 { 2.0 } else { -1.0 }).collect();
        let x_data = random_vec(8, 52);
        let expected = reference_mul(8, &row_offsets, &cols, &values, &x_data, 1.0);

        let queues = host_queues(2);
        let options = MatrixOptions {
            strategy: PartitionStrategy::Explicit(vec![0, 4, 8]),
            ..MatrixOptions::default()
        };
        let a =
            SparseMatrix::from_csr_with(&queues, 8, &row_offsets, &cols, &values, options).await?;
        assert_eq!(a.exchanged_columns(), 0);

        let x = a.vector(&x_data)?;
        let mut y = a.zero_vector()?;
        let before: Vec<_> = queues
            .iter()
            .map(|queue| queue.context().transfer_stats())
            .collect();

        a.mul(&x, &mut y, 1.0, false).await?;
        let out = y.read_to_vec().await?;
        assert_approx_eq_vec(&out, &expected, 1e-10);

        // The only traffic since the snapshot is reading y back; the product
        // itself staged nothing.
        for (device, queue) in queues.iter().enumerate() {
            let stats = queue.context().transfer_stats();
            assert_eq!(stats.bytes_to_device, before[device].bytes_to_device);
            let read_back = 4 * std::mem::size_of::<f64>() as u64;
            assert_eq!(
                stats.bytes_from_device,
                before[device].bytes_from_device + read_back
            );
        }
        Ok(())
    })
}

#[test]
fn only_the_coupled_devices_touch_the_boundary() -> Result<(), Error> {
    block_on(async {
        // Device 0 reads one column owned by device 2 and vice versa;
        // device 1 is purely diagonal and stays out of the exchange.
        let n = 48;
        let mut row_offsets = vec![0u32];
        let mut cols = Vec::new();
        let mut values = Vec::new();
        for row in 0..n {
            let mut entries = vec![(row as u32, 2.0)];
            if row < 16 {
                entries.push((40, -1.0));
            } else if row >= 32 {
                entries.push((8, -1.0));
            }
            entries.sort_by_key(|&(col, _)| col);
            for (col, value) in entries {
                cols.push(col);
                values.push(value);
            }
            row_offsets.push(cols.len() as u32);
        }
        let x_data = random_vec(n, 62);
        let expected = reference_mul(n, &row_offsets, &cols, &values, &x_data, 1.0);

        let queues = host_queues(3);
        let options = MatrixOptions {
            strategy: PartitionStrategy::Explicit(vec![0, 16, 32, 48]),
            ..MatrixOptions::default()
        };
        let a =
            SparseMatrix::from_csr_with(&queues, n, &row_offsets, &cols, &values, options).await?;

        assert_eq!(a.exchanged_columns(), 2);
        let outer = a.device_report(0).unwrap();
        assert_eq!((outer.send_count, outer.ghost_count), (1, 1));
        assert_eq!(outer.remote_nonzeros, 16);
        let middle = a.device_report(1).unwrap();
        assert_eq!((middle.send_count, middle.ghost_count), (0, 0));
        assert_eq!(middle.remote_nonzeros, 0);
        let far = a.device_report(2).unwrap();
        assert_eq!((far.send_count, far.ghost_count), (1, 1));

        let x = a.vector(&x_data)?;
        let mut y = a.zero_vector()?;
        a.mul(&x, &mut y, 1.0, false).await?;
        assert_approx_eq_vec(&y.read_to_vec().await?, &expected, 1e-10);
        Ok(())
    })
}

#[test]
fn one_row_can_span_several_devices() -> Result<(), Error> {
    block_on(async {
        // Diagonal matrix, except row 0 also reads a column owned by each
        // of the other three devices.
        let n = 96;
        let mut row_offsets = vec![0u32];
        let mut cols = Vec::new();
        let mut values = Vec::new();
        for row in 0..n {
            if row == 0 {
                for col in [0u32, 30, 60, 90] {
                    cols.push(col);
                    values.push(if col == 0 { 2.0 } else { -1.0 });
                }
            } else {
                cols.push(row as u32);
                values.push(2.0);
            }
            row_offsets.push(cols.len() as u32);
        }
        let x_data = random_vec(n, 81);
        let expected = reference_mul(n, &row_offsets, &cols, &values, &x_data, 1.0);

        let queues = host_queues(4);
        let options = MatrixOptions {
            strategy: PartitionStrategy::Explicit(vec![0, 24, 48, 72, 96]),
            ..MatrixOptions::default()
        };
        let a =
            SparseMatrix::from_csr_with(&queues, n, &row_offsets, &cols, &values, options).await?;

        let first = a.device_report(0).unwrap();
        assert_eq!((first.send_count, first.ghost_count), (0, 3));
        for device in 1..4 {
            let report = a.device_report(device).unwrap();
            assert_eq!((report.send_count, report.ghost_count), (1, 0));
        }

        let x = a.vector(&x_data)?;
        let mut y = a.zero_vector()?;
        a.mul(&x, &mut y, 1.0, false).await?;
        assert_approx_eq_vec(&y.read_to_vec().await?, &expected, 1e-10);
        Ok(())
    })
}

#[test]
fn ghost_contribution_lands_exactly_once() -> Result<(), Error> {
    block_on(async {
        // Six rows split 3/3; row 3 is the only coupling, reading column 2
        // from the first device.
        let row_offsets = vec![0u32, 1, 2, 3, 5, 6, 7];
        let cols = vec![0u32, 1, 2, 2, 3, 4, 5];
        let values = vec![1.0, 1.0, 1.0, 10.0, 1.0, 1.0, 1.0];

        let queues = host_queues(2);
        let options = MatrixOptions {
            strategy: PartitionStrategy::Explicit(vec![0, 3, 6]),
            ..MatrixOptions::default()
        };
        let a =
            SparseMatrix::from_csr_with(&queues, 6, &row_offsets, &cols, &values, options).await?;

        assert_eq!(a.exchanged_columns(), 1);
        assert_eq!(a.device_report(0).unwrap().send_count, 1);
        let receiver = a.device_report(1).unwrap();
        assert_eq!((receiver.send_count, receiver.ghost_count), (0, 1));
        assert_eq!(receiver.remote_nonzeros, 1);

        let x = a.vector(&[1.0; 6])?;
        let mut y = a.zero_vector()?;
        a.mul(&x, &mut y, 1.0, false).await?;
        assert_eq!(y.read_to_vec().await?, vec![1.0, 1.0, 1.0, 11.0, 1.0, 1.0]);
        Ok(())
    })
}

#[test]
fn basis_vectors_recover_the_columns() -> Result<(), Error> {
    block_on(async {
        let row_offsets = vec![0u32, 1, 3, 4, 6, 7, 9];
        let cols = vec![0u32, 1, 4, 2, 3, 0, 4, 5, 2];
        let values: Vec<f64> = (1..=9).map(f64::from).collect();

        let queues = host_queues(2);
        let options = MatrixOptions {
            strategy: PartitionStrategy::Explicit(vec![0, 3, 6]),
            ..MatrixOptions::default()
        };
        let a =
            SparseMatrix::from_csr_with(&queues, 6, &row_offsets, &cols, &values, options).await?;

        for j in 0..6 {
            let mut basis = vec![0.0; 6];
            basis[j] = 1.0;
            let expected = reference_mul(6, &row_offsets, &cols, &values, &basis, 1.0);

            let x = a.vector(&basis)?;
            let mut y = a.zero_vector()?;
            a.mul(&x, &mut y, 1.0, false).await?;
            assert_approx_eq_vec(&y.read_to_vec().await?, &expected, 1e-10);
        }
        Ok(())
    })
}

#[test]
fn degenerate_dimensions_still_work() -> Result<(), Error> {
    block_on(async {
        let queues = host_queues(2);
        let a = SparseMatrix::<f64>::from_csr(&queues, 0, &[0u32], &[] as &[u32], &[]).await?;
        let x = a.vector(&[])?;
        let mut y = a.zero_vector()?;
        a.mul(&x, &mut y, 1.0, false).await?;
        assert!(y.read_to_vec().await?.is_empty());

        let queues = host_queues(1);
        let a = SparseMatrix::from_csr(&queues, 1, &[0u32, 1], &[0u32], &[5.0]).await?;
        let x = a.vector(&[3.0])?;
        let mut y = a.zero_vector()?;
        a.mul(&x, &mut y, 1.0, false).await?;
        assert_eq!(y.read_to_vec().await?, vec![15.0]);
        Ok(())
    })
}

#[test]
fn vectors_can_be_rewritten_between_products() -> Result<(), Error> {
    block_on(async {
        let n = 32;
        let (row_offsets, cols, values) = random_csr(n, 4, 71);
        let first = random_vec(n, 72);
        let second = random_vec(n, 73);

        let queues = host_queues(2);
        let a = SparseMatrix::from_csr(&queues, n, &row_offsets, &cols, &values).await?;
        let mut x = a.vector(&first)?;
        let mut y = a.zero_vector()?;

        a.mul(&x, &mut y, 1.0, false).await?;
        let expected = reference_mul(n, &row_offsets, &cols, &values, &first, 1.0);
        assert_approx_eq_vec(&y.read_to_vec().await?, &expected, 1e-10);

        x.write_from_slice(&second)?;
        a.mul(&x, &mut y, 1.0, false).await?;
        let expected = reference_mul(n, &row_offsets, &cols, &values, &second, 1.0);
        assert_approx_eq_vec(&y.read_to_vec().await?, &expected, 1e-10);
        Ok(())
    })
}

#[test]
fn kernel_compilation_is_reused_across_matrices() -> Result<(), Error> {
    block_on(async {
        let n = 32;
        let (row_offsets, cols, values) = random_csr(n, 3, 77);
        let queues = host_queues(2);

        let a = SparseMatrix::from_csr(&queues, n, &row_offsets, &cols, &values).await?;
        let x = a.vector(&random_vec(n, 78))?;
        let mut y = a.zero_vector()?;
        a.mul(&x, &mut y, 1.0, false).await?;
        y.read_to_vec().await?;
        let counts: Vec<_> = queues
            .iter()
            .map(|queue| queue.context().compiled_kernel_count())
            .collect();

        // A second matrix on the same queues reuses every compiled program.
        let b = SparseMatrix::from_csr(&queues, n, &row_offsets, &cols, &values).await?;
        let x = b.vector(&random_vec(n, 79))?;
        let mut y = b.zero_vector()?;
        b.mul(&x, &mut y, 1.0, false).await?;
        y.read_to_vec().await?;
        for (queue, count) in queues.iter().zip(counts) {
            assert_eq!(queue.context().compiled_kernel_count(), count);
        }
        Ok(())
    })
}
