mod common;

use approx::assert_abs_diff_eq;
use flowgam::data::DataError;
use flowgam::Dataset;

#[test]
fn test_csv_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.csv");
    let observations = common::synthetic_observations(48, 0.5, 3);
    common::write_csv(&path, &observations);

    let data = Dataset::from_csv_path(&path).unwrap();
    assert_eq!(data.len(), 48);
    assert!(data.series_breaks().is_empty());

    let flow = data.column("flow").unwrap();
    let log_flow = data.column("log_flow").unwrap();
    for (f, l) in flow.iter().zip(log_flow.iter()) {
        assert_abs_diff_eq!(f.ln(), *l, epsilon = 1e-9);
    }
    assert_eq!(data.column("soi").unwrap(), data.column("SOI").unwrap());
}

#[test]
fn test_log_flow_column_is_optional_and_rows_are_sorted() {
    let csv = "month,flow,rain,SOI,moy,time\n\
               1990-03,4.0,55.0,0.3,3,3\n\
               1990-01,2.0,40.0,-1.2,1,1\n\
               1990-02,3.0,61.5,0.0,2,2\n";
    let data = Dataset::from_reader(csv.as_bytes()).unwrap();
    assert_eq!(data.column("time").unwrap().to_vec(), vec![1.0, 2.0, 3.0]);
    assert_abs_diff_eq!(data.column("log_flow").unwrap()[0], 2.0f64.ln(), epsilon = 1e-12);
    assert_eq!(data.observations()[0].month, "1990-01");
}

#[test]
fn test_gaps_split_the_series() {
    let csv = "month,flow,rain,SOI,moy,time\n\
               a,1.0,1.0,0.0,1,1\n\
               b,1.0,1.0,0.0,2,2\n\
               c,1.0,1.0,0.0,5,5\n\
               d,1.0,1.0,0.0,6,6\n";
    let data = Dataset::from_reader(csv.as_bytes()).unwrap();
    assert_eq!(data.series_breaks(), vec![2]);
}

#[test]
fn test_rejects_invalid_files() {
    let negative = "month,flow,rain,SOI,moy,time\na,-1.0,1.0,0.0,1,1\n";
    assert!(matches!(
        Dataset::from_reader(negative.as_bytes()),
        Err(DataError::InvalidRow { row: 1, .. })
    ));

    let bad_month = "month,flow,rain,SOI,moy,time\na,1.0,1.0,0.0,1,1\nb,1.0,1.0,0.0,13,2\n";
    assert!(matches!(
        Dataset::from_reader(bad_month.as_bytes()),
        Err(DataError::InvalidRow { row: 2, .. })
    ));

    let mismatched_log = "month,flow,rain,SOI,moy,time,log_flow\na,1.0,1.0,0.0,1,1,0.5\n";
    assert!(Dataset::from_reader(mismatched_log.as_bytes()).is_err());

    let duplicate = "month,flow,rain,SOI,moy,time\na,1.0,1.0,0.0,1,1\nb,1.0,1.0,0.0,2,1\n";
    assert!(matches!(
        Dataset::from_reader(duplicate.as_bytes()),
        Err(DataError::DuplicateTime { .. })
    ));

    let missing_column = "month,flow,SOI,moy,time\na,1.0,0.0,1,1\n";
    assert!(matches!(
        Dataset::from_reader(missing_column.as_bytes()),
        Err(DataError::Csv(_))
    ));

    assert!(matches!(
        Dataset::from_reader("month,flow,rain,SOI,moy,time\n".as_bytes()),
        Err(DataError::Empty)
    ));
    assert!(matches!(
        Dataset::from_csv_path("/nonexistent/flow.csv"),
        Err(DataError::Open { .. })
    ));
}
