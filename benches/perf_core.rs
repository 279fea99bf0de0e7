use criterion::{black_box, criterion_group, criterion_main, Criterion};
use git_split::diff::{diff_summary, split_diff, SUMMARY_MAX_CHARS};
use git_split::plan::{Goal, Plan};

fn synthetic_diff(file_count: usize, hunks_per_file: usize) -> String {
    let mut out = String::new();
    for f in 0..file_count {
        let path = format!("src/feature_{:03}/file_{:05}.rs", f % 120, f);
        out.push_str(&format!("diff --git a/{path} b/{path}\n"));
        out.push_str("index 1111111..2222222 100644\n");
        out.push_str(&format!("--- a/{path}\n+++ b/{path}\n"));
        for h in 0..hunks_per_file {
            let start = h * 40 + 1;
            out.push_str(&format!("@@ -{start},7 +{start},8 @@ fn item_{h}() {{\n"));
            out.push_str("     let a = 1;\n     let b = 2;\n     let c = 3;\n");
            out.push_str("-    old_call(a, b);\n+    new_call(a, b);\n+    trace(c);\n");
            out.push_str("     done();\n");
        }
        if f % 50 == 0 {
            out.push_str("diff --git a/assets/logo.png b/assets/logo.png\n");
            out.push_str("Binary files a/assets/logo.png and b/assets/logo.png differ\n");
        }
    }
    out
}

fn bench_split_diff(c: &mut Criterion) {
    let diff = synthetic_diff(400, 6);
    c.bench_function("split_diff_400_files", |b| {
        b.iter(|| {
            let split = split_diff(black_box(&diff));
            black_box(split.hunks.len());
        })
    });
}

fn bench_summary(c: &mut Criterion) {
    let hunks = split_diff(&synthetic_diff(400, 6)).hunks;
    c.bench_function("diff_summary_2400_hunks", |b| {
        b.iter(|| black_box(diff_summary(black_box(&hunks), SUMMARY_MAX_CHARS)))
    });
}

fn bench_plan_render(c: &mut Criterion) {
    let hunks = split_diff(&synthetic_diff(200, 4)).hunks;
    let goals: Vec<Goal> = (1..=12)
        .map(|id| Goal::new(id, format!("feat: change set {id}")))
        .collect();
    let mut plan = Plan::with_goals(&goals);
    for (idx, hunk) in hunks.into_iter().enumerate() {
        let _ = plan.assign((idx % 12) as u32 + 1, hunk);
    }
    c.bench_function("plan_render_800_hunks", |b| {
        b.iter(|| black_box(plan.render()))
    });
}

criterion_group!(perf_core, bench_split_diff, bench_summary, bench_plan_render);
criterion_main!(perf_core);
