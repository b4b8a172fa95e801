mod common;

use std::sync::Arc;

use tapecut_core::{ExportConfig, ExportQueue, ExportTask, QueueConfig, QueueEvent, TaskState};
use tapecut_media::{TrimExporter, probe};

fn fast_exporter() -> Arc<TrimExporter> {
    Arc::new(TrimExporter::new(ExportConfig { x264_preset: "ultrafast".into(), ..Default::default() }))
}

#[test]
fn batch_exports_every_task_on_a_bounded_pool() {
    let fx = common::tape(3.0);
    let out_dir = fx.out_dir().join("out");
    let queue = ExportQueue::new(QueueConfig { max_workers: Some(2), ..Default::default() });

    let tasks: Vec<ExportTask> = [(0.0, 1.0), (1.0, 2.0), (1.5, 3.0)]
        .iter()
        .enumerate()
        .map(|(i, &(start, end))| ExportTask::new(&fx.path, format!("part {i}"), start, end, None).unwrap())
        .collect();
    for t in &tasks {
        queue.add(t.clone());
    }

    let handle = queue.run_all(fast_exporter(), &out_dir).unwrap();
    let mut last_overall = 0.0;
    for event in handle.events().iter() {
        match event {
            QueueEvent::Progress { overall, .. } => {
                assert!(overall >= last_overall);
                last_overall = overall;
            }
            QueueEvent::BatchComplete(_) => break,
            _ => {}
        }
    }
    let summary = handle.wait();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(queue.progress_fraction(), 1.0);
    for (task, expected) in tasks.iter().zip([1.0, 1.0, 1.5]) {
        assert_eq!(task.state(), TaskState::Succeeded);
        let out = task.output_path().unwrap();
        assert!(out.starts_with(&out_dir));
        let duration = probe(&out).unwrap().duration.unwrap();
        assert!((duration - expected).abs() < 0.15, "{} lasted {duration}", out.display());
    }
}

#[test]
fn one_bad_source_does_not_stop_the_batch() {
    let fx = common::tape(2.0);
    let queue = ExportQueue::new(QueueConfig { max_workers: Some(2), ..Default::default() });

    let good = ExportTask::new(&fx.path, "good", 0.0, 1.0, None).unwrap();
    let bad = ExportTask::new(fx.out_dir().join("missing.avi"), "bad", 0.0, 1.0, None).unwrap();
    queue.add(good.clone());
    queue.add(bad.clone());

    let summary = queue.run_all(fast_exporter(), fx.out_dir()).unwrap().wait();

    assert_eq!((summary.succeeded, summary.failed), (1, 1));
    assert!(good.is_succeeded());
    assert!(bad.is_failed());
    assert!(!fx.out_dir().join("bad.mp4").exists());
    assert_eq!(queue.completed(), 2);
}

#[test]
fn independent_sources_all_succeed() {
    let fx = common::tape(1.0);
    let sources: Vec<_> = (0..4)
        .map(|i| {
            let path = fx.out_dir().join(format!("tape-{i}.mp4"));
            common::write_tape(&path, 2.0 + i as f64 * 0.5, i % 2 == 0);
            path
        })
        .collect();
    let out_dir = fx.out_dir().join("out");
    let queue = ExportQueue::new(QueueConfig { max_workers: Some(3), ..Default::default() });

    let tasks: Vec<ExportTask> = sources
        .iter()
        .map(|src| {
            let name = src.file_stem().unwrap().to_str().unwrap().to_string();
            ExportTask::new(src, name, 0.5, 1.5, None).unwrap()
        })
        .collect();
    for t in &tasks {
        queue.add(t.clone());
    }

    let handle = queue.run_all(fast_exporter(), &out_dir).unwrap();
    for event in handle.events().iter() {
        // 1.0 only once the batch has been accounted as finished.
        if queue.progress_fraction() == 1.0 {
            assert!(handle.is_finished());
        }
        if matches!(event, QueueEvent::BatchComplete(_)) {
            break;
        }
    }
    let summary = handle.wait();

    assert_eq!((summary.total, summary.succeeded), (4, 4));
    assert_eq!(queue.progress_fraction(), 1.0);
    for (task, src) in tasks.iter().zip(&sources) {
        assert!(task.is_succeeded(), "{}: {:?}", src.display(), task.failure());
        assert!(task.output_path().unwrap().exists());
    }
}
