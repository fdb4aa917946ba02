/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! A non-distributed run driven through the public lifecycle entry
//! points: init, a few records, finalize, all against a single rank.

use std::fs;

use recorder::config::ENV_TRACES_DIR;
use recorder::funcs;
use recorder::meta::{GlobalMeta, LocalMeta, GLOBAL_META_FILENAME, VERSION_FILENAME};
use recorder::{append_record, observe_filename, recorder_finalize, recorder_init, Record};

fn args(values: &[&str]) -> Vec<Option<String>> {
    values.iter().map(|v| Some((*v).to_owned())).collect()
}

#[test]
fn test_non_distributed_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let traces_dir = tmp.path().join("recorder-logs");
    std::env::set_var(ENV_TRACES_DIR, &traces_dir);

    recorder_init();
    // A second init must be a no-op.
    recorder_init();

    let open = funcs::id_by_name("open").unwrap();
    let close = funcs::id_by_name("close").unwrap();
    observe_filename("/tmp/traced-file");
    append_record(Record::new(open, 0.000001, 0.000002, 3, args(&["/tmp/traced-file", "0"])));
    append_record(Record::new(close, 0.000003, 0.000004, 0, args(&["3"])));

    recorder_finalize();
    // A second finalize must be a no-op as well.
    recorder_finalize();

    assert!(traces_dir.join("0.itf").exists());

    let (global, names) =
        GlobalMeta::parse(&fs::read(traces_dir.join(GLOBAL_META_FILENAME)).unwrap()).unwrap();
    assert_eq!(1, global.total_ranks);
    assert_eq!(funcs::FUNC_COUNT, names.len());
    assert!(fs::read(traces_dir.join(VERSION_FILENAME)).unwrap().len() > 0);

    let local =
        LocalMeta::parse(&fs::read(traces_dir.join("0.mt")).unwrap(), funcs::FUNC_COUNT).unwrap();
    assert_eq!(2, local.total_records);
    assert_eq!(1, local.files.len());
    assert_eq!("/tmp/traced-file", local.files[0].name);

    // Records appended after finalize are dropped on the floor.
    append_record(Record::new(open, 0.0, 0.0, 0, vec![]));
    let local =
        LocalMeta::parse(&fs::read(traces_dir.join("0.mt")).unwrap(), funcs::FUNC_COUNT).unwrap();
    assert_eq!(2, local.total_records);
}
