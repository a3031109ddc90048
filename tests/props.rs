//! Property sidecar and overwrite-store integration: a `props.json` saved
//! by one process must change how a later `ParserHandle` built through
//! `cli::normalize` behaves, and an `OverwriteStore` plugged into a
//! `ParserHandle` must substitute cell values exactly once.

use std::fs;

use tempfile::tempdir;

use zsv::cli::{normalize, parse_common_args};
use zsv::error::Status;
use zsv::parser::ParserHandle;
use zsv::props::{FileProperties, OverwriteRecord, OverwriteStore};

#[test]
fn saved_header_span_changes_what_cli_normalize_produces() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("sales.csv");
    fs::write(&input, "Sales,Sales\nQ1,Q2\n100,200\n").unwrap();

    let props = FileProperties::new(Some(2), None);
    props.save(&input, false).unwrap();

    let args = vec![input.to_string_lossy().into_owned()];
    let common = parse_common_args(&args).unwrap();
    let (opts, _) = normalize(&common);
    assert_eq!(opts.header_span, 2);

    let mut parser = ParserHandle::new(opts, Box::new(fs::File::open(&input).unwrap())).unwrap();
    loop {
        match parser.parse_more() {
            Status::Ok => {}
            _ => break,
        }
    }
    parser.finish();
    assert_eq!(parser.header(), &["Sales;Q1".to_string(), "Sales;Q2".to_string()]);
}

#[test]
fn overwrite_store_substitutes_cell_values_in_row_column_order() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("data.csv");
    fs::write(&input, "a,b\n1,2\n3,4\n").unwrap();

    let store = OverwriteStore::open(&input).unwrap();
    // Row 0 is the header row (spec.md §6); row 2, col 1 is the second
    // data row's "b" cell.
    store.put(&OverwriteRecord { row: 2, col: 1, value: "corrected".into(), timestamp: None, author: None }).unwrap();

    let mut parser = ParserHandle::new(Default::default(), Box::new(fs::File::open(&input).unwrap())).unwrap();
    parser.set_overwrites(store.cursor().unwrap());
    let mut seen = Vec::new();
    while parser.next_row().unwrap().is_some() {
        let row: Vec<String> = (0..parser.cell_count()).map(|i| parser.get_cell(i).try_as_str().unwrap().to_string()).collect();
        seen.push(row);
    }
    // The first row yielded by `next_row` is the assembled header row.
    assert_eq!(seen[0], vec!["a".to_string(), "b".to_string()]);
    assert_eq!(seen[1], vec!["1".to_string(), "2".to_string()]);
    assert_eq!(seen[2], vec!["3".to_string(), "corrected".to_string()]);
}

#[test]
fn props_save_without_overwrite_flag_refuses_to_clobber() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("data.csv");
    fs::write(&input, "a,b\n1,2\n").unwrap();
    let props = FileProperties::new(Some(1), Some(0));
    props.save(&input, false).unwrap();
    assert!(props.save(&input, false).is_err());
    assert!(props.save(&input, true).is_ok());
}
