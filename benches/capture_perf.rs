#[path = "../src/capture/mod.rs"]
mod capture;

use capture::{read_all, CaptureWriter, Record};

fn main() {
    divan::main();
}

fn make_records(len: usize) -> Vec<Record> {
    (0..len)
        .map(|idx| {
            let matched = idx % 7 == 0;
            let text = if matched {
                format!("src/lib.rs:{}:{}: error: expected `;`", idx + 1, idx % 40)
            } else {
                format!("test module_{idx}::case ... ok")
            };
            Record::new(idx as u64 + 1, text, matched, if idx % 2 == 0 { "out" } else { "err" })
        })
        .collect()
}

#[divan::bench(args = [1000usize, 10000usize])]
fn capture_write(bencher: divan::Bencher, len: usize) {
    let dir = tempfile::tempdir().expect("tempdir");
    let records = make_records(len);
    bencher.counter(len).bench(|| {
        let mut writer = CaptureWriter::create_temp(dir.path(), "ot-bench-").expect("writer");
        for record in &records {
            writer.encode(record).expect("encode");
        }
        let path = writer.close().expect("close");
        std::fs::remove_file(path).expect("remove");
    });
}

#[divan::bench(args = [1000usize, 10000usize])]
fn capture_read(bencher: divan::Bencher, len: usize) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut writer = CaptureWriter::create_temp(dir.path(), "ot-bench-").expect("writer");
    for record in make_records(len) {
        writer.encode(&record).expect("encode");
    }
    let path = writer.close().expect("close");
    bencher.counter(len).bench(|| {
        let records = read_all(&path).expect("read");
        divan::black_box(records.len());
    });
}
