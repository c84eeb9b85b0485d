#[path = "../src/rules.rs"]
mod rules;

use rules::{RuleSet, RuleSpec};

fn main() {
    divan::main();
}

fn make_lines(len: usize) -> Vec<String> {
    (0..len)
        .map(|idx| {
            if idx % 10 == 0 {
                format!("error[E0308]: mismatched types --> src/module_{idx}.rs:{}:{}", idx + 1, idx % 80)
            } else {
                format!("   Compiling crate-{idx:05} v0.1.{idx} (/home/dev/work/crate-{idx:05})")
            }
        })
        .collect()
}

fn extra_rules() -> RuleSet {
    RuleSet::compile(&[
        RuleSpec::default_rule(),
        RuleSpec {
            id: "python".to_string(),
            regex: r#"File "([^"]+)", line (\d+)"#.to_string(),
            file_group: 1,
            line_group: 2,
            column_group: 0,
        },
        RuleSpec {
            id: "todo".to_string(),
            regex: r"\bTODO\b".to_string(),
            file_group: 0,
            line_group: 0,
            column_group: 0,
        },
    ])
    .expect("bench rules compile")
}

#[divan::bench(args = [100usize, 1000usize, 10000usize])]
fn rules_any_match_default(bencher: divan::Bencher, len: usize) {
    let rules = RuleSet::default_rules();
    let lines = make_lines(len);
    bencher.counter(len).bench(|| {
        let matched = lines.iter().filter(|line| rules.any_match(line).0).count();
        divan::black_box(matched);
    });
}

#[divan::bench(args = [100usize, 1000usize, 10000usize])]
fn rules_any_match_three_rules(bencher: divan::Bencher, len: usize) {
    let rules = extra_rules();
    let lines = make_lines(len);
    bencher.counter(len).bench(|| {
        let matched = lines.iter().filter(|line| rules.any_match(line).0).count();
        divan::black_box(matched);
    });
}

#[divan::bench(args = [100usize, 1000usize])]
fn rules_all_spans(bencher: divan::Bencher, len: usize) {
    let rules = extra_rules();
    let lines = make_lines(len);
    bencher.counter(len).bench(|| {
        let spans: usize = lines.iter().map(|line| rules.all_spans(line).len()).sum();
        divan::black_box(spans);
    });
}

#[divan::bench]
fn rules_extract_location(bencher: divan::Bencher) {
    let rules = RuleSet::default_rules();
    let line = "warning: unused variable `x` --> ./src/viewer/render_cells.rs:1042:17";
    bencher.bench(|| divan::black_box(rules.extract_path_line_col(line)));
}
