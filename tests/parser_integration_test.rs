use tmy_builder::parser::Parser;
use tmy_builder::variables::ProviderVariable;

const HEADER: &str = "valid_time,latitude,longitude,t2m,d2m,sp,u10,v10,ssrd,tcc,tp";

/// Test parsing a full provider response with every variable
#[test]
fn test_parse_full_response() {
    let file_content = format!(
        "{}\n\
         2010-06-01 12:00:00,40.7,-74.0,295.2,285.1,101200.0,2.5,-1.5,2880000.0,0.4,0.0002\n\
         2010-06-01 13:00:00,40.7,-74.0,296.0,285.3,101150.0,2.7,-1.2,2950000.0,0.35,0.0\n",
        HEADER
    );

    let (records, stats) = Parser::parse_response(&file_content).expect("Parse failed");

    assert_eq!(records.len(), 2);
    assert_eq!(stats.parsed_successfully, 2);
    assert_eq!(stats.parse_failures, 0);

    let first = &records[0];
    assert_eq!(first.get(ProviderVariable::Temperature2m), Some(295.2));
    assert_eq!(first.get(ProviderVariable::Dewpoint2m), Some(285.1));
    assert_eq!(first.get(ProviderVariable::SurfacePressure), Some(101200.0));
    assert_eq!(
        first.get(ProviderVariable::SolarRadiationDownwards),
        Some(2880000.0)
    );
    assert_eq!(first.get(ProviderVariable::TotalPrecipitation), Some(0.0002));
}

/// Test that NaN and empty fields become missing values rather than errors
#[test]
fn test_parse_missing_values() {
    let file_content = format!(
        "{}\n2010-06-01 12:00:00,40.7,-74.0,NaN,285.1,,2.5,-1.5,nan,0.4,\n",
        HEADER
    );

    let (records, stats) = Parser::parse_response(&file_content).expect("Parse failed");

    assert_eq!(stats.parse_failures, 0);
    let record = &records[0];
    assert_eq!(record.get(ProviderVariable::Temperature2m), None);
    assert_eq!(record.get(ProviderVariable::SurfacePressure), None);
    assert_eq!(record.get(ProviderVariable::SolarRadiationDownwards), None);
    assert_eq!(record.get(ProviderVariable::TotalPrecipitation), None);
    assert_eq!(record.get(ProviderVariable::Dewpoint2m), Some(285.1));
}

/// Test parsing file with only whitespace
#[test]
fn test_parse_whitespace_only_file() {
    let file_content = "   \n\n  \n\n";
    let result = Parser::parse_response(file_content);

    // Whitespace-only response returns Ok with no records
    assert!(result.is_ok());
    let (records, stats) = result.unwrap();
    assert_eq!(records.len(), 0);
    assert_eq!(stats.parse_failures, 0);
}

/// Test that whitespace-only lines between rows are counted, not treated as failures
#[test]
fn test_blank_lines_between_rows() {
    let file_content = "valid_time,t2m\n2010-01-01 00:00:00,273.15\n   \n\n2010-01-01 01:00:00,274.15\n";

    let (records, stats) = Parser::parse_response(file_content).expect("Parse failed");
    assert_eq!(records.len(), 2);
    assert_eq!(stats.parse_failures, 0);
    assert_eq!(stats.empty_lines, 1);
    assert_eq!(stats.failure_rate, 0.0);
}

/// Test that quoted headers and fields are read like bare ones
#[test]
fn test_parse_quoted_fields() {
    let file_content = "\"valid_time\",\"t2m\",\"note\"\n\
                        \"2010-01-01 00:00:00\",273.15,\"calm, clear\"\n\
                        \"2010-01-01 01:00:00\",\"274.15\",\"\"\n";

    let (records, stats) = Parser::parse_response(file_content).expect("Parse failed");

    assert_eq!(stats.parse_failures, 0);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].get(ProviderVariable::Temperature2m), Some(273.15));
    assert_eq!(records[1].get(ProviderVariable::Temperature2m), Some(274.15));
}

/// Test that rows with the wrong number of fields fail individually
#[test]
fn test_short_row_counts_as_failure() {
    let mut file_content = String::from("valid_time,t2m,d2m\n");
    for hour in 0..10 {
        file_content.push_str(&format!("2010-01-01 {:02}:00:00,273.15,270.0\n", hour));
    }
    file_content.push_str("2010-01-01 10:00:00,273.15\n");

    let (records, stats) =
        Parser::parse_response_with_threshold(&file_content, 0.10).expect("Parse failed");
    assert_eq!(records.len(), 10);
    assert_eq!(stats.parse_failures, 1);
}

/// Test custom failure threshold
#[test]
fn test_parse_custom_failure_threshold() {
    // 50% failure rate
    let file_content = "valid_time,t2m\n\
                        invalid line\n\
                        2010-01-01 00:00:00,273.15";

    // Default threshold (10%) should reject
    let result = Parser::parse_response(file_content);
    assert!(result.is_err());

    // Higher threshold (60%) should accept
    let result = Parser::parse_response_with_threshold(file_content, 0.60);
    assert!(result.is_ok());
    let (records, stats) = result.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(stats.parse_failures, 1);
}

/// Test that unknown columns are ignored and known ones kept
#[test]
fn test_unknown_columns_ignored() {
    let file_content = "number,valid_time,expver,t2m\n\
                        0,2010-01-01T00:00,0001,273.15\n";

    let (records, _) = Parser::parse_response(file_content).expect("Parse failed");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].values.len(), 1);
    assert_eq!(records[0].get(ProviderVariable::Temperature2m), Some(273.15));
}

/// Test that a body with rows but no parsable rows is rejected
#[test]
fn test_all_rows_unparsable_rejected() {
    let file_content = "valid_time,t2m\nnot-a-date,273.15\n";
    let result = Parser::parse_response_with_threshold(file_content, 1.0);

    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("No records successfully parsed"));
}
