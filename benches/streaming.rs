use criterion::{criterion_group, criterion_main, Criterion, black_box};

use rkstream::streaming::{AllocParams, SlotIndex, SlotTable};

fn params(max_size: u32) -> AllocParams {
    AllocParams {
        max_size,
        growth_step: 64,
        evict_age_threshold: 2,
        ..Default::default()
    }
}

fn bench_allocate_release_cycle(c: &mut Criterion) {
    let table: SlotTable<u64> = SlotTable::new();
    let p = params(4096);
    // Warm up so the cycle runs on the free list only
    let warm: Vec<SlotIndex> = (0..4096)
        .filter_map(|_| table.find_or_create_slot(&p).map(|a| a.index))
        .collect();
    for &slot in &warm {
        table.release(slot);
    }

    c.bench_function("slot_allocate_release_1024", |b| {
        b.iter(|| {
            let mut slots = Vec::with_capacity(1024);
            for _ in 0..1024 {
                if let Some(acquired) = table.find_or_create_slot(black_box(&p)) {
                    slots.push(acquired.index);
                }
            }
            for slot in slots {
                table.release(slot);
            }
        });
    });
}

fn bench_steal_from_unused(c: &mut Criterion) {
    c.bench_function("slot_steal_4096", |b| {
        b.iter_with_setup(
            || {
                let table: SlotTable<u64> = SlotTable::new();
                let p = params(4096);
                for _ in 0..4096 {
                    table.find_or_create_slot(&p);
                }
                // Age everything into the unused list
                for _ in 0..4 {
                    table.start_frame(|_, _| {});
                }
                (table, p)
            },
            |(table, p)| {
                for _ in 0..4096 {
                    black_box(table.find_or_create_slot(&p));
                }
            },
        );
    });
}

fn bench_sweep(c: &mut Criterion) {
    let table: SlotTable<u64> = SlotTable::new();
    let p = params(4096);
    let slots: Vec<SlotIndex> = (0..4096)
        .filter_map(|_| table.find_or_create_slot(&p).map(|a| a.index))
        .collect();

    c.bench_function("sweep_4096_half_touched", |b| {
        b.iter(|| {
            for slot in slots.iter().step_by(2) {
                table.touch(*slot);
            }
            let mut active = 0usize;
            table.start_frame(|_, _| active += 1);
            black_box(active)
        });
    });
}

criterion_group!(
    benches,
    bench_allocate_release_cycle,
    bench_steal_from_unused,
    bench_sweep,
);
criterion_main!(benches);
