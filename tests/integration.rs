use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn estate_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_estate"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("q1.csv"),
        "price,date,buyer,seller,property,area\n\
         950000,2024-01-15,Alice,Bob,P-1,Dubai Marina\n\
         ,2024-02-01,Carol,Dan,P-2,Dubai Marina\n\
         1200000,2024-03-15,Eve,Frank,P-3,Downtown Dubai\n",
    )
    .unwrap();
    fs::write(
        files_dir.join("lease.txt"),
        "This lease agreement is governed by the laws of Dubai. The tenant shall pay rent quarterly. \
         Either party may terminate this agreement with sixty days notice.",
    )
    .unwrap();
    fs::write(files_dir.join("broken.csv"), "price,date\n\"950000,2024-01-01\n").unwrap();
    fs::write(files_dir.join("notes.docx"), "not really a docx").unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/estate.sqlite"

[ingest.retry]
max_attempts = 2
base_delay_ms = 1
max_delay_ms = 5

[server]
bind = "127.0.0.1:7410"
"#,
        root.display()
    );

    let config_path = config_dir.join("estate.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_estate(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = estate_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run estate binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn file(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("files")
        .join(name)
        .display()
        .to_string()
}

/// Minimal single-page PDF showing `phrase`, with correct xref offsets so
/// pdf-extract can parse it.
fn minimal_pdf(phrase: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 72 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let mut offsets = Vec::new();
    offsets.push(out.len());
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    offsets.push(out.len());
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    offsets.push(out.len());
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    offsets.push(out.len());
    out.extend_from_slice(
        format!("4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n", content.len(), content).as_bytes(),
    );
    offsets.push(out.len());
    out.extend_from_slice(b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n");
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

/// Workbook with one sheet of transactions: two valid rows, one without a date.
fn transactions_xlsx() -> Vec<u8> {
    let shared = r#"<sst><si><t>Price</t></si><si><t>Date</t></si><si><t>Property</t></si><si><t>Area</t></si></sst>"#;
    let sheet = r#"<worksheet><sheetData>
        <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c><c r="C1" t="s"><v>2</v></c><c r="D1" t="s"><v>3</v></c></row>
        <row r="2"><c r="A2"><v>2100000</v></c><c r="B2"><v>45300</v></c><c r="C2" t="inlineStr"><is><t>X-10</t></is></c><c r="D2" t="inlineStr"><is><t>Palm Jumeirah</t></is></c></row>
        <row r="3"><c r="A3"><v>1850000</v></c><c r="B3" t="str"><v>2024-05-02</v></c><c r="C3" t="inlineStr"><is><t>X-11</t></is></c></row>
        <row r="4"><c r="A4"><v>990000</v></c><c r="C4" t="inlineStr"><is><t>X-12</t></is></c></row>
    </sheetData></worksheet>"#;
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("xl/sharedStrings.xml", options).unwrap();
        zip.write_all(shared.as_bytes()).unwrap();
        zip.start_file("xl/worksheets/sheet1.xml", options).unwrap();
        zip.write_all(sheet.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    cursor.into_inner()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_estate(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/estate.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    assert!(run_estate(&config_path, &["init"]).2);
    let (_, stderr, success) = run_estate(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_estate(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_ingest_csv_reports_partial_success() {
    let (_tmp, config_path) = setup_test_env();
    let csv = file(&config_path, "q1.csv");
    let (stdout, stderr, success) = run_estate(&config_path, &["ingest", &csv]);
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("category=transaction"), "{}", stdout);
    assert!(stdout.contains("records=2"), "{}", stdout);
    assert!(stdout.contains("warnings=1"), "{}", stdout);
    assert!(stdout.contains("validation_failed"), "{}", stdout);
}

#[test]
fn test_ingest_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    let csv = file(&config_path, "q1.csv");
    let lease = file(&config_path, "lease.txt");
    assert!(run_estate(&config_path, &["ingest", &csv, &lease]).2);

    let (stdout, stderr, success) = run_estate(&config_path, &["ingest", &csv, &lease]);
    assert!(success, "re-ingest failed: {}", stderr);
    assert_eq!(stdout.matches("records=0 chunks=0").count(), 2, "{}", stdout);
}

#[test]
fn test_ingest_continues_past_a_broken_file() {
    let (_tmp, config_path) = setup_test_env();
    let broken = file(&config_path, "broken.csv");
    let lease = file(&config_path, "lease.txt");
    let (stdout, _, success) = run_estate(&config_path, &["ingest", &broken, &lease]);
    assert!(!success);
    assert!(stdout.contains("error [extraction_failed]"), "{}", stdout);
    assert!(stdout.contains("category=legal"), "{}", stdout);
}

#[test]
fn test_ingest_unknown_extension_needs_format() {
    let (_tmp, config_path) = setup_test_env();
    let docx = file(&config_path, "notes.docx");
    let (_, stderr, success) = run_estate(&config_path, &["ingest", &docx]);
    assert!(!success);
    assert!(stderr.contains("cannot detect format"), "{}", stderr);

    let (stdout, _, success) = run_estate(&config_path, &["ingest", "--format", "docx", &docx]);
    assert!(!success);
    assert!(stdout.contains("error [unsupported_format]"), "{}", stdout);
}

#[test]
fn test_ingest_xlsx() {
    let (tmp, config_path) = setup_test_env();
    let path = tmp.path().join("files/sales.xlsx");
    fs::write(&path, transactions_xlsx()).unwrap();
    let (stdout, stderr, success) = run_estate(&config_path, &["ingest", path.to_str().unwrap()]);
    assert!(success, "xlsx ingest failed: {}", stderr);
    assert!(stdout.contains("category=transaction"), "{}", stdout);
    assert!(stdout.contains("records=2"), "{}", stdout);
    assert!(stdout.contains("warnings=1"), "{}", stdout);
}

#[test]
fn test_ingest_pdf() {
    let (tmp, config_path) = setup_test_env();
    let path = tmp.path().join("files/tenancy.pdf");
    fs::write(
        &path,
        minimal_pdf("The tenant shall pay rent under this agreement and the landlord shall maintain the unit"),
    )
    .unwrap();
    let (stdout, stderr, success) = run_estate(&config_path, &["ingest", path.to_str().unwrap()]);
    assert!(success, "pdf ingest failed: {} {}", stdout, stderr);
    assert!(!stdout.contains("error ["), "{}", stdout);
}

#[test]
fn test_chat_prints_merged_response() {
    let (_tmp, config_path) = setup_test_env();
    let csv = file(&config_path, "q1.csv");
    assert!(run_estate(&config_path, &["ingest", &csv]).2);

    let (stdout, stderr, success) = run_estate(
        &config_path,
        &["chat", "--session", "cli", "transaction history in Dubai Marina"],
    );
    assert!(success, "chat failed: {}", stderr);
    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(response["session_id"], "cli");
    assert!(!response["sections"].as_array().unwrap().is_empty());
}

#[test]
fn test_lead_action_and_nurture_pass() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_estate(&config_path, &["lead", "L-1", "contacted"]);
    assert!(success, "lead failed: {}", stderr);
    let lead: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(lead["lead_id"], "L-1");
    assert_eq!(lead["recent_contacts"], 1);

    let (stdout, stderr, success) = run_estate(&config_path, &["nurture"]);
    assert!(success, "nurture failed: {}", stderr);
    assert!(stdout.contains("nurture: 1 leads"), "{}", stdout);
}

#[test]
fn test_lead_unknown_action_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_estate(&config_path, &["lead", "L-1", "ghosted"]);
    assert!(!success);
    assert!(stderr.contains("unknown lead action"));
}
