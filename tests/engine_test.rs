// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! End-to-end tests: graphs built with `GraphBuilder` and run by `Engine`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::common::{collected, engine_config, spilling_config, take, tasks, with_init};
use vanilla_dag::{
    BytesShuffleContract, EdgeKind, Engine, EngineConfig, EngineError, ExecutionSummary,
    GraphBuilder, GraphDescription, GraphExecutor, TaskContext, TaskInfo, TaskSchedule,
    VertexAttribute,
};

mod common;

type Group = (Vec<u8>, Vec<Vec<u8>>);

fn write_records(ctx: &mut TaskContext, port: &str, records: &[Vec<u8>]) -> vanilla_dag::EngineResult<()> {
    let mut writer = ctx.acquire_output(port)?.into_records()?;
    for record in records {
        writer.write(record)?;
    }
    writer.close()
}

fn read_records(ctx: &TaskContext, port: &str) -> vanilla_dag::EngineResult<Vec<Vec<u8>>> {
    let mut reader = ctx.acquire_input(port, 0, 1)?.into_records()?;
    let mut out = Vec::new();
    while let Some(record) = reader.next()? {
        out.push(record.to_vec());
    }
    Ok(out)
}

fn read_groups(ctx: &TaskContext, port: &str) -> vanilla_dag::EngineResult<Vec<Group>> {
    let mut reader = ctx.acquire_partition_input(port)?.into_groups()?;
    let mut out = Vec::new();
    while reader.next_group()? {
        let key = reader.key().to_vec();
        let mut values = Vec::new();
        while let Some(value) = reader.next_value()? {
            values.push(value.to_vec());
        }
        out.push((key, values));
    }
    Ok(out)
}

/// Producer -> consumer over a one-to-one edge.
fn pipeline(
    producer: Arc<dyn vanilla_dag::VertexProcessorFactory>,
    consumer: Arc<dyn vanilla_dag::VertexProcessorFactory>,
    kind: EdgeKind,
) -> GraphDescription {
    let mut g = GraphBuilder::new();
    let src = g.add_vertex("src", producer);
    let dst = g.add_vertex("dst", consumer);
    let out = g.add_output(src, "out").unwrap();
    let input = g.add_input(dst, "in").unwrap();
    g.connect(out, input, kind).unwrap();
    g.build().unwrap()
}

/// Mapper -> reducer over a scatter-gather edge; the reducer runs one task per partition.
fn shuffle_graph(pairs: Vec<(Vec<u8>, Vec<u8>)>, mappers: usize, sink: common::Collected<(usize, Group)>) -> GraphDescription {
    let pairs = Arc::new(pairs);
    let mut g = GraphBuilder::new();
    let map = g.add_vertex(
        "map",
        tasks(mappers, move |ctx| {
            let mut writer = ctx.acquire_output("out")?.into_key_values()?;
            for (i, (key, value)) in pairs.iter().enumerate() {
                if i % ctx.task_count() == ctx.task_index() {
                    writer.write(key, value)?;
                }
            }
            writer.close()
        }),
    );
    let reduce = g.add_vertex(
        "reduce",
        with_init(
            |ctx| Ok(Some(TaskSchedule::with_count(ctx.partition_count()))),
            move |ctx| {
                let groups = read_groups(ctx, "in")?;
                let mut sink = sink.lock().unwrap();
                sink.extend(groups.into_iter().map(|g| (ctx.task_index(), g)));
                Ok(())
            },
        ),
    );
    let out = g.add_output(map, "out").unwrap();
    let input = g.add_input(reduce, "in").unwrap();
    g.connect_shuffle(out, input, Arc::new(BytesShuffleContract)).unwrap();
    g.build().unwrap()
}

#[test]
fn one_to_one_delivers_every_record_once() {
    let seen = collected::<Vec<u8>>();
    let sink = Arc::clone(&seen);
    let graph = pipeline(
        tasks(3, |ctx| {
            let records = (0..2)
                .map(|j| format!("t{}-{}", ctx.task_index(), j).into_bytes())
                .collect::<Vec<_>>();
            write_records(ctx, "out", &records)
        }),
        tasks(3, move |ctx| {
            let records = read_records(ctx, "in")?;
            sink.lock().unwrap().extend(records);
            Ok(())
        }),
        EdgeKind::OneToOne,
    );
    let summary = Engine::new(engine_config(64 * 1024, 64)).execute(graph).unwrap();

    let mut got = take(&seen);
    got.sort();
    let mut expected = (0..3)
        .flat_map(|i| (0..2).map(move |j| format!("t{i}-{j}").into_bytes()))
        .collect::<Vec<_>>();
    expected.sort();
    assert_eq!(got, expected);
    assert_eq!(summary.vertices_completed, 2);
    assert_eq!(summary.tasks_run, 6);
    assert_eq!(summary.pool.outstanding_bytes, 0);
}

#[test]
fn broadcast_is_replayed_to_initialize_and_every_task() {
    let counts = collected::<(String, usize)>();
    let init_sink = Arc::clone(&counts);
    let task_sink = Arc::clone(&counts);
    let graph = pipeline(
        tasks(1, |ctx| {
            let records = (0..5u8).map(|i| vec![i; 3]).collect::<Vec<_>>();
            write_records(ctx, "out", &records)
        }),
        with_init(
            move |ctx| {
                let mut reader = ctx.acquire_input("in", 0, 1)?.into_records()?;
                let mut n = 0;
                while reader.next()?.is_some() {
                    n += 1;
                }
                init_sink.lock().unwrap().push(("init".to_string(), n));
                Ok(Some(TaskSchedule::with_count(2)))
            },
            move |ctx| {
                let n = read_records(ctx, "in")?.len();
                task_sink
                    .lock()
                    .unwrap()
                    .push((format!("task{}", ctx.task_index()), n));
                Ok(())
            },
        ),
        EdgeKind::Broadcast,
    );
    let summary = Engine::new(engine_config(64 * 1024, 16)).execute(graph).unwrap();

    let mut got = take(&counts);
    got.sort();
    assert_eq!(
        got,
        vec![
            ("init".to_string(), 5),
            ("task0".to_string(), 5),
            ("task1".to_string(), 5)
        ]
    );
    assert_eq!(summary.pool.outstanding_bytes, 0);
}

#[test]
fn scatter_gather_groups_keys_into_disjoint_sorted_partitions() {
    let pairs = (0..300u32)
        .map(|i| {
            (
                format!("k{:03}", i % 37).into_bytes(),
                i.to_le_bytes().to_vec(),
            )
        })
        .collect::<Vec<_>>();
    let seen = collected();
    let graph = shuffle_graph(pairs.clone(), 3, Arc::clone(&seen));
    let mut config = engine_config(256 * 1024, 256);
    config.shuffle.partition_count = 4;
    config.shuffle.sort_buffer_bytes = 512;
    config.shuffle.merge_threshold = 4;
    let summary = Engine::new(config).execute(graph).unwrap();

    let got = take(&seen);
    let mut by_partition: BTreeMap<usize, Vec<Vec<u8>>> = BTreeMap::new();
    let mut values_by_key: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>> = BTreeMap::new();
    for (partition, (key, values)) in got {
        by_partition.entry(partition).or_default().push(key.clone());
        assert!(
            values_by_key.insert(key, values.into_iter().collect()).is_none(),
            "key delivered twice"
        );
    }
    for keys in by_partition.values() {
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys out of order: {keys:?}");
    }
    let mut expected: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>> = BTreeMap::new();
    for (key, value) in pairs {
        expected.entry(key).or_default().insert(value);
    }
    assert_eq!(values_by_key, expected);
    assert_eq!(summary.tasks_run, 3 + 4);
    assert_eq!(summary.pool.outstanding_bytes, 0);
}

#[test]
fn scatter_gather_reproduces_the_documented_example() {
    // Mapper task 0 writes (1,a) and (2,b); task 1 writes (1,c).
    let pairs = vec![
        (b"1".to_vec(), b"a".to_vec()),
        (b"1".to_vec(), b"c".to_vec()),
        (b"2".to_vec(), b"b".to_vec()),
    ];
    let seen = collected();
    let graph = shuffle_graph(pairs, 2, Arc::clone(&seen));
    Engine::new(engine_config(64 * 1024, 64)).execute(graph).unwrap();

    let groups = take(&seen)
        .into_iter()
        .map(|(_, (key, mut values))| {
            values.sort();
            (key, values)
        })
        .collect::<Vec<_>>();
    assert_eq!(
        groups,
        vec![
            (b"1".to_vec(), vec![b"a".to_vec(), b"c".to_vec()]),
            (b"2".to_vec(), vec![b"b".to_vec()]),
        ]
    );
}

#[test]
fn cascading_merge_matches_single_pass_merge() {
    let pairs = (0..400u32)
        .map(|i| {
            (
                format!("key-{:02}", (i * 7) % 23).into_bytes(),
                format!("v{i}").into_bytes(),
            )
        })
        .collect::<Vec<_>>();
    let run = |threshold: usize, factor: f64| {
        let seen = collected();
        // One mapper keeps run order, and so value order, deterministic.
        let graph = shuffle_graph(pairs.clone(), 1, Arc::clone(&seen));
        let mut config: EngineConfig = engine_config(256 * 1024, 128);
        config.shuffle.sort_buffer_bytes = 160;
        config.shuffle.merge_threshold = threshold;
        config.shuffle.merge_factor = factor;
        Engine::new(config).execute(graph).unwrap();
        take(&seen)
    };
    let cascaded = run(2, 1.0);
    let single = run(1024, 0.5);
    assert!(!single.is_empty());
    assert_eq!(cascaded, single);
}

#[test]
fn nothing_edge_orders_vertices() {
    let produced = Arc::new(AtomicBool::new(false));
    let observed = collected::<bool>();
    let flag = Arc::clone(&produced);
    let check = Arc::clone(&produced);
    let sink = Arc::clone(&observed);
    let graph = pipeline(
        tasks(1, move |ctx| {
            thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::SeqCst);
            ctx.acquire_output("out")?.close()
        }),
        tasks(2, move |ctx| {
            assert!(ctx.acquire_input("in", 0, 1)?.into_records().is_err());
            sink.lock().unwrap().push(check.load(Ordering::SeqCst));
            Ok(())
        }),
        EdgeKind::Nothing,
    );
    Engine::new(engine_config(4096, 64)).execute(graph).unwrap();
    assert_eq!(take(&observed), vec![true, true]);
}

#[test]
fn max_concurrency_attribute_bounds_running_tasks() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    let mut g = GraphBuilder::new();
    let v = g.add_vertex(
        "bounded",
        tasks(8, move |_ctx| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    g.add_attribute(v, VertexAttribute::MaxConcurrency(2)).unwrap();
    g.add_attribute(v, VertexAttribute::Label("bounded-stage".to_string()))
        .unwrap();
    let summary = Engine::new(engine_config(4096, 64))
        .execute(g.build().unwrap())
        .unwrap();
    assert_eq!(summary.tasks_run, 8);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[test]
fn task_hints_reach_their_tasks() {
    let seen = collected::<(usize, String)>();
    let sink = Arc::clone(&seen);
    let mut g = GraphBuilder::new();
    g.add_vertex(
        "hinted",
        with_init(
            |_ctx| {
                let tasks = ["a.dat", "b.dat", "c.dat"]
                    .iter()
                    .map(|name| TaskInfo::with_hint(name.to_string()))
                    .collect();
                Ok(Some(TaskSchedule::new(tasks)))
            },
            move |ctx| {
                let hint = ctx.task_info().hint::<String>().cloned().unwrap_or_default();
                sink.lock().unwrap().push((ctx.task_index(), hint));
                Ok(())
            },
        ),
    );
    Engine::new(engine_config(4096, 64))
        .execute(g.build().unwrap())
        .unwrap();
    let mut got = take(&seen);
    got.sort();
    assert_eq!(
        got,
        vec![
            (0, "a.dat".to_string()),
            (1, "b.dat".to_string()),
            (2, "c.dat".to_string())
        ]
    );
}

#[test]
fn task_failure_cancels_the_graph_and_releases_memory() {
    let downstream_ran = Arc::new(AtomicBool::new(false));
    let ran = Arc::clone(&downstream_ran);
    let mut g = GraphBuilder::new();
    let src = g.add_vertex(
        "src",
        tasks(2, |ctx| {
            let mut writer = ctx.acquire_output("out")?.into_records()?;
            for i in 0..50u32 {
                writer.write(&i.to_le_bytes())?;
            }
            if ctx.task_index() == 1 {
                return Err(EngineError::internal("boom"));
            }
            writer.close()
        }),
    );
    let dst = g.add_vertex(
        "dst",
        tasks(1, move |_ctx| {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        }),
    );
    g.add_vertex(
        "spinner",
        tasks(1, |ctx| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(2));
            }
            ctx.check_cancelled()
        }),
    );
    let out = g.add_output(src, "out").unwrap();
    let input = g.add_input(dst, "in").unwrap();
    g.connect(out, input, EdgeKind::OneToOne).unwrap();

    let executor = GraphExecutor::new(g.build().unwrap(), engine_config(64 * 1024, 64)).unwrap();
    let pool = executor.buffer_pool().clone();
    let err = executor.run().unwrap_err();

    match &err {
        EngineError::VertexFailed { vertex, .. } => assert_eq!(vertex, "src"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(err.root(), EngineError::Internal(msg) if msg == "boom"));
    assert!(!downstream_ran.load(Ordering::SeqCst));
    assert_eq!(pool.outstanding_bytes(), 0);
}

#[test]
fn panicking_task_becomes_internal_error() {
    let mut g = GraphBuilder::new();
    let v = g.add_vertex(
        "fragile",
        tasks(1, |_ctx| -> vanilla_dag::EngineResult<()> { panic!("kaboom") }),
    );
    g.add_attribute(v, VertexAttribute::Label("fragile-stage".to_string()))
        .unwrap();
    let err = Engine::new(engine_config(4096, 64))
        .execute(g.build().unwrap())
        .unwrap_err();
    assert!(err.to_string().contains("fragile-stage"), "{err}");
    match err.root() {
        EngineError::Internal(msg) => assert!(msg.contains("kaboom"), "{msg}"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn failing_initialize_fails_the_vertex() {
    let mut g = GraphBuilder::new();
    g.add_vertex(
        "bad-init",
        with_init(
            |_ctx| Err(EngineError::graph("no splits")),
            |_ctx| Ok(()),
        ),
    );
    let err = Engine::new(engine_config(4096, 64))
        .execute(g.build().unwrap())
        .unwrap_err();
    assert!(matches!(err.root(), EngineError::GraphConsistency(_)));
}

#[test]
fn retained_chunks_spill_when_the_budget_is_tiny() {
    let (config, _dir) = spilling_config(1024, 128);
    let seen = collected::<Vec<u8>>();
    let sink = Arc::clone(&seen);
    let graph = pipeline(
        tasks(1, |ctx| {
            let records = (0..100u8).map(|i| vec![i; 50]).collect::<Vec<_>>();
            write_records(ctx, "out", &records)
        }),
        tasks(1, move |ctx| {
            let records = read_records(ctx, "in")?;
            sink.lock().unwrap().extend(records);
            Ok(())
        }),
        EdgeKind::OneToOne,
    );
    let summary = Engine::new(config).execute(graph).unwrap();

    let got = take(&seen);
    assert_eq!(got.len(), 100);
    assert_eq!(got[42], vec![42u8; 50]);
    assert!(summary.pool.spills > 0);
    assert!(summary.pool.restores > 0);
    assert!(summary.spill.is_some_and(|s| s.files_written > 0));
    assert_eq!(summary.pool.outstanding_bytes, 0);
}

/// Run `executor` on its own thread; a hang fails the test instead of blocking it.
fn run_with_deadline(executor: GraphExecutor) -> vanilla_dag::EngineResult<ExecutionSummary> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(executor.run());
    });
    rx.recv_timeout(Duration::from_secs(30))
        .expect("execution did not finish")
}

#[test]
fn over_budget_edge_without_spill_fails_instead_of_hanging() {
    let graph = pipeline(
        tasks(1, |ctx| {
            let records = (0..200u8).map(|i| vec![i; 60]).collect::<Vec<_>>();
            write_records(ctx, "out", &records)
        }),
        tasks(1, |ctx| read_records(ctx, "in").map(|_| ())),
        EdgeKind::OneToOne,
    );
    let executor = GraphExecutor::new(graph, engine_config(1024, 128)).unwrap();
    let pool = executor.buffer_pool().clone();
    let err = run_with_deadline(executor).unwrap_err();

    assert!(
        matches!(
            err.root(),
            EngineError::BudgetExceeded {
                requested: 128,
                budget: 1024
            }
        ),
        "{err}"
    );
    assert_eq!(pool.outstanding_bytes(), 0);
}

#[test]
fn scatter_gather_merges_many_runs_in_a_tiny_budget() {
    let pairs = (0..2000u32)
        .map(|i| (format!("k{:02}", i % 97).into_bytes(), i.to_le_bytes().to_vec()))
        .collect::<Vec<_>>();
    let seen = collected();
    let graph = shuffle_graph(pairs, 1, Arc::clone(&seen));
    // 16 pool buffers with the default merge threshold and factor.
    let (mut config, _dir) = spilling_config(4096, 256);
    config.shuffle.sort_buffer_bytes = 1024;
    let executor = GraphExecutor::new(graph, config).unwrap();
    let summary = run_with_deadline(executor).unwrap();

    let got = take(&seen);
    assert_eq!(got.len(), 97);
    assert_eq!(got.iter().map(|(_, (_, v))| v.len()).sum::<usize>(), 2000);
    assert!(summary.pool.spills > 0);
    assert!(summary.pool.peak_bytes <= 4096);
    assert_eq!(summary.pool.outstanding_bytes, 0);
}

#[test]
fn hot_key_group_larger_than_the_budget_stays_within_it() {
    let values = (0..2000u32)
        .map(|i| {
            let mut value = format!("{i:06}").into_bytes();
            value.resize(100, b'.');
            value
        })
        .collect::<Vec<_>>();
    let pairs = values
        .iter()
        .map(|v| (b"hot".to_vec(), v.clone()))
        .collect::<Vec<_>>();
    let seen = collected();
    let graph = shuffle_graph(pairs, 1, Arc::clone(&seen));
    let (mut config, _dir) = spilling_config(4096, 256);
    config.shuffle.sort_buffer_bytes = 1024;
    let summary = run_with_deadline(GraphExecutor::new(graph, config).unwrap()).unwrap();

    let got = take(&seen);
    assert_eq!(got.len(), 1);
    let (_, (key, group)) = &got[0];
    assert_eq!(key, b"hot");
    // One mapper and a stable merge keep write order.
    assert_eq!(group, &values);
    assert!(summary.pool.peak_bytes <= 4096);
    assert_eq!(summary.pool.outstanding_bytes, 0);
}

#[test]
fn concurrent_readers_of_one_partition_each_get_whole_groups() {
    let pairs = (0..600u32)
        .map(|i| (format!("k{:03}", i % 53).into_bytes(), i.to_le_bytes().to_vec()))
        .collect::<Vec<_>>();
    let readers = 3;
    let seen = collected::<(usize, Group)>();
    let sink = Arc::clone(&seen);
    let shared = Arc::new(pairs.clone());
    let mut g = GraphBuilder::new();
    let map = g.add_vertex(
        "map",
        tasks(2, move |ctx| {
            let mut writer = ctx.acquire_output("out")?.into_key_values()?;
            for (i, (key, value)) in shared.iter().enumerate() {
                if i % ctx.task_count() == ctx.task_index() {
                    writer.write(key, value)?;
                }
            }
            writer.close()
        }),
    );
    let reduce = g.add_vertex(
        "reduce",
        tasks(readers, move |ctx| {
            // Every task reads partition 0 of 1.
            let mut reader = ctx.acquire_input("in", 0, 1)?.into_groups()?;
            while reader.next_group()? {
                let key = reader.key().to_vec();
                let mut values = Vec::new();
                while let Some(value) = reader.next_value()? {
                    values.push(value.to_vec());
                    thread::sleep(Duration::from_micros(50));
                }
                sink.lock().unwrap().push((ctx.task_index(), (key, values)));
            }
            Ok(())
        }),
    );
    let out = g.add_output(map, "out").unwrap();
    let input = g.add_input(reduce, "in").unwrap();
    g.connect_shuffle(out, input, Arc::new(BytesShuffleContract)).unwrap();
    let (mut config, _dir) = spilling_config(64 * 1024, 128);
    config.shuffle.sort_buffer_bytes = 512;
    let summary = Engine::new(config).execute(g.build().unwrap()).unwrap();

    let mut expected: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>> = BTreeMap::new();
    for (key, value) in pairs {
        expected.entry(key).or_default().insert(value);
    }
    let mut got: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>> = BTreeMap::new();
    let mut tasks_seen = BTreeSet::new();
    for (task, (key, values)) in take(&seen) {
        tasks_seen.insert(task);
        let count = values.len();
        let set = values.into_iter().collect::<BTreeSet<_>>();
        assert_eq!(set.len(), count, "duplicate value in a group");
        assert!(got.insert(key, set).is_none(), "group split across readers");
    }
    assert_eq!(got, expected);
    assert!(tasks_seen.len() <= readers);
    assert_eq!(summary.tasks_run, 2 + readers);
    assert_eq!(summary.pool.outstanding_bytes, 0);
}

#[test]
fn broadcast_fan_in_delivers_the_union_to_every_reader() {
    let seen = collected::<(usize, Vec<Vec<u8>>)>();
    let sink = Arc::clone(&seen);
    let mut g = GraphBuilder::new();
    let left = g.add_vertex(
        "left",
        tasks(2, |ctx| {
            let records = (0..40u32)
                .map(|i| format!("L{}-{i}", ctx.task_index()).into_bytes())
                .collect::<Vec<_>>();
            write_records(ctx, "out", &records)
        }),
    );
    let right = g.add_vertex(
        "right",
        tasks(1, |ctx| {
            let records = (0..25u32).map(|i| format!("R-{i}").into_bytes()).collect::<Vec<_>>();
            write_records(ctx, "out", &records)
        }),
    );
    let join = g.add_vertex(
        "join",
        tasks(3, move |ctx| {
            let records = read_records(ctx, "in")?;
            sink.lock().unwrap().push((ctx.task_index(), records));
            Ok(())
        }),
    );
    let left_out = g.add_output(left, "out").unwrap();
    let right_out = g.add_output(right, "out").unwrap();
    let input = g.add_input(join, "in").unwrap();
    g.connect(left_out, input, EdgeKind::Broadcast).unwrap();
    g.connect(right_out, input, EdgeKind::Broadcast).unwrap();
    let summary = Engine::new(engine_config(64 * 1024, 64))
        .execute(g.build().unwrap())
        .unwrap();

    let mut expected = (0..2)
        .flat_map(|t| (0..40).map(move |i| format!("L{t}-{i}").into_bytes()))
        .chain((0..25).map(|i| format!("R-{i}").into_bytes()))
        .collect::<Vec<_>>();
    expected.sort();
    let got = take(&seen);
    assert_eq!(got.len(), 3);
    for (task, mut records) in got {
        records.sort();
        assert_eq!(records, expected, "reader task {task} missed records");
    }
    assert_eq!(summary.pool.outstanding_bytes, 0);
}

#[test]
fn spill_failure_fails_the_vertex_and_releases_memory() {
    let (mut config, _dir) = spilling_config(1024, 128);
    if let Some(spill) = config.spill.as_mut() {
        // Room for about two spill files.
        spill.dir_max_bytes = 300;
    }
    let consumer_ran = Arc::new(AtomicBool::new(false));
    let ran = Arc::clone(&consumer_ran);
    let graph = pipeline(
        tasks(1, |ctx| {
            let records = (0..100u8).map(|i| vec![i; 50]).collect::<Vec<_>>();
            write_records(ctx, "out", &records)
        }),
        tasks(1, move |_ctx| {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        }),
        EdgeKind::OneToOne,
    );
    let executor = GraphExecutor::new(graph, config).unwrap();
    let pool = executor.buffer_pool().clone();
    let err = run_with_deadline(executor).unwrap_err();

    match &err {
        EngineError::VertexFailed { vertex, .. } => assert_eq!(vertex, "src"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(err.root(), EngineError::Storage { .. }), "{err}");
    assert!(!consumer_ran.load(Ordering::SeqCst));
    assert_eq!(pool.outstanding_bytes(), 0);
}
