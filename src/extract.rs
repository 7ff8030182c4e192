//! Extractor adapters: PDF, CSV, Excel and plain text to normalized text.
//!
//! Every adapter returns UTF-8 text; corrupt input is an [`ExtractError`],
//! fatal for that document and never retried. Tabular formats normalize to
//! CSV: a CSV file passes through after validation, and each XLSX worksheet
//! becomes one CSV block, blocks separated by a blank line. The structured
//! extractor reads both through [`csv_tables`].

use std::collections::BTreeMap;
use std::io::Read;

use chrono::Utc;
use quick_xml::events::Event;

use estate_harness_core::hash::sha256_hex;
use estate_harness_core::models::{DocumentFormat, NormalizedDocument};

use crate::error::ExtractError;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Excel's column limit (`XFD`).
const XLSX_MAX_COLUMNS: usize = 16_384;
/// Maximum fields in the dense rows built from one sparse sheet.
const XLSX_MAX_GRID_CELLS: usize = 2_000_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

/// Normalize raw bytes of a declared format.
pub fn normalize(
    bytes: &[u8],
    format: DocumentFormat,
    max_bytes: usize,
) -> Result<NormalizedDocument, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(ExtractError::TooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }
    let raw_text = extract_text(bytes, format)?;
    Ok(NormalizedDocument {
        source_id: sha256_hex(bytes),
        raw_text,
        format,
        byte_size: bytes.len(),
        extracted_at: Utc::now(),
    })
}

pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<String, ExtractError> {
    match format {
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Csv => {
            let text = decode_utf8(bytes, "csv")?;
            parse_csv(&text)?;
            Ok(text)
        }
        DocumentFormat::Excel => extract_xlsx(bytes),
        DocumentFormat::Text => decode_utf8(bytes, "text"),
    }
}

fn decode_utf8(bytes: &[u8], kind: &'static str) -> Result<String, ExtractError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let text = std::str::from_utf8(bytes).map_err(|_| ExtractError::InvalidUtf8(kind))?;
    Ok(text.replace("\r\n", "\n"))
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════
// CSV
// ═══════════════════════════════════════════════════════════════════════

/// Parse CSV text into rows of fields.
///
/// Supports quoted fields with `""` escapes and embedded newlines. A blank
/// line yields an empty row, which [`csv_tables`] treats as a table break.
pub fn parse_csv(text: &str) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut after_quote = false;
    let mut line = 1usize;
    let mut quote_line = 1usize;
    let mut line_has_content = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => {
                    in_quotes = false;
                    after_quote = true;
                }
                '\n' => {
                    line += 1;
                    field.push('\n');
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            ',' => {
                row.push(std::mem::take(&mut field));
                after_quote = false;
                line_has_content = true;
            }
            '\n' => {
                if line_has_content || !field.is_empty() {
                    row.push(std::mem::take(&mut field));
                }
                rows.push(std::mem::take(&mut row));
                after_quote = false;
                line_has_content = false;
                line += 1;
            }
            '\r' => {}
            '"' if field.trim().is_empty() && !after_quote => {
                field.clear();
                in_quotes = true;
                quote_line = line;
                line_has_content = true;
            }
            _ if after_quote => {
                if !c.is_whitespace() {
                    return Err(ExtractError::MalformedCsv {
                        line,
                        reason: format!("unexpected '{}' after closing quote", c),
                    });
                }
            }
            '"' => {
                return Err(ExtractError::MalformedCsv {
                    line,
                    reason: "quote inside unquoted field".to_string(),
                });
            }
            _ => {
                field.push(c);
                line_has_content = true;
            }
        }
    }
    if in_quotes {
        return Err(ExtractError::MalformedCsv {
            line: quote_line,
            reason: "unterminated quoted field".to_string(),
        });
    }
    if line_has_content || !field.is_empty() {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}

/// Split CSV text into tables at blank lines, trimming every cell.
/// Each table's first row is its header.
pub fn csv_tables(text: &str) -> Result<Vec<Vec<Vec<String>>>, ExtractError> {
    let mut tables = Vec::new();
    let mut current: Vec<Vec<String>> = Vec::new();
    for row in parse_csv(text)? {
        let trimmed: Vec<String> = row.iter().map(|f| f.trim().to_string()).collect();
        if trimmed.iter().all(|f| f.is_empty()) {
            if !current.is_empty() {
                tables.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(trimmed);
    }
    if !current.is_empty() {
        tables.push(current);
    }
    Ok(tables)
}

/// Render one CSV line, quoting fields that need it.
pub fn csv_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| {
            if f.contains([',', '"', '\n']) {
                format!("\"{}\"", f.replace('"', "\"\""))
            } else {
                f.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

// ═══════════════════════════════════════════════════════════════════════
// XLSX
// ═══════════════════════════════════════════════════════════════════════

fn xlsx_err(e: impl std::fmt::Display) -> ExtractError {
    ExtractError::Xlsx(e.to_string())
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive.by_name(name).map_err(xlsx_err)?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(xlsx_err)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Xlsx(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(xlsx_err)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_names = list_worksheet_names(&archive);
    if sheet_names.is_empty() {
        return Err(ExtractError::Xlsx("workbook has no worksheets".to_string()));
    }

    let mut blocks = Vec::new();
    for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name)?;
        let rows = read_sheet_rows(&sheet_xml, &shared_strings)?;
        if rows.is_empty() {
            continue;
        }
        let block = rows
            .iter()
            .map(|r| csv_line(r))
            .collect::<Vec<_>>()
            .join("\n");
        blocks.push(block);
    }
    Ok(blocks.join("\n\n"))
}

/// Shared string table; a workbook without one has only inline or numeric cells.
fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    const NAME: &str = "xl/sharedStrings.xml";
    if !archive.file_names().any(|n| n == NAME) {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, NAME)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = current.is_some(),
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    if let Some(s) = current.take() {
                        strings.push(s);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(xlsx_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(archive: &Archive<'_>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Shared,
    Inline,
    Value,
}

/// Zero-based column index of a cell reference like `"AB12"`.
///
/// `Ok(None)` when the reference has no column letters; an error when the
/// column lies beyond `XFD`.
fn column_index(cell_ref: &str) -> Result<Option<usize>, ExtractError> {
    let letters = cell_ref.bytes().take_while(u8::is_ascii_alphabetic);
    let mut index = 0usize;
    let mut seen = false;
    for b in letters {
        seen = true;
        let digit = usize::from(b.to_ascii_uppercase() - b'A') + 1;
        index = index
            .checked_mul(26)
            .and_then(|i| i.checked_add(digit))
            .filter(|i| *i <= XLSX_MAX_COLUMNS)
            .ok_or_else(|| xlsx_err(format!("cell reference '{}' is beyond column XFD", cell_ref)))?;
    }
    Ok(seen.then(|| index - 1))
}

fn cell_column(e: &quick_xml::events::BytesStart<'_>, fallback: usize) -> Result<usize, ExtractError> {
    let col = match attr(e, b"r") {
        Some(r) => column_index(&r)?.unwrap_or(fallback),
        None => fallback,
    };
    if col >= XLSX_MAX_COLUMNS {
        return Err(xlsx_err(format!("row has more than {} columns", XLSX_MAX_COLUMNS)));
    }
    Ok(col)
}

fn attr(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == key)
        .map(|a| String::from_utf8_lossy(a.value.as_ref()).into_owned())
}

/// Read a worksheet into dense rows. Gaps between referenced cells become
/// empty fields; fully empty rows are dropped.
fn read_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut grid: BTreeMap<u32, BTreeMap<usize, String>> = BTreeMap::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut row_num = 0u32;
    let mut next_col = 0usize;
    let mut col = 0usize;
    let mut kind = CellKind::Value;
    let mut in_cell = false;
    let mut in_value = false;
    let mut value = String::new();
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    row_num = attr(&e, b"r")
                        .and_then(|r| r.parse().ok())
                        .unwrap_or(row_num + 1);
                    next_col = 0;
                }
                b"c" => {
                    in_cell = true;
                    value.clear();
                    col = cell_column(&e, next_col)?;
                    kind = match attr(&e, b"t").as_deref() {
                        Some("s") => CellKind::Shared,
                        Some("inlineStr") => CellKind::Inline,
                        _ => CellKind::Value,
                    };
                }
                b"v" | b"t" if in_cell => in_value = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"c" => {
                next_col = cell_column(&e, next_col)? + 1;
            }
            Ok(Event::Text(te)) if in_value => {
                value.push_str(&te.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    in_cell = false;
                    let text = match kind {
                        CellKind::Shared => value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                            .unwrap_or_default(),
                        CellKind::Inline | CellKind::Value => value.clone(),
                    };
                    if !text.trim().is_empty() {
                        grid.entry(row_num).or_default().insert(col, text);
                        cell_count += 1;
                    }
                    next_col = col + 1;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(xlsx_err(e)),
            _ => {}
        }
        buf.clear();
    }

    let width = grid
        .values()
        .filter_map(|cells| cells.keys().next_back())
        .max()
        .map(|max| max + 1)
        .unwrap_or(0);
    if width.checked_mul(grid.len()).map_or(true, |cells| cells > XLSX_MAX_GRID_CELLS) {
        return Err(xlsx_err(format!(
            "sheet spans {} rows by {} columns, limit is {} fields",
            grid.len(),
            width,
            XLSX_MAX_GRID_CELLS
        )));
    }
    Ok(grid
        .into_values()
        .map(|cells| {
            let mut row = vec![String::new(); width];
            for (c, text) in cells {
                row[c] = text;
            }
            row
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_xlsx(shared: &str, sheets: &[&str]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("xl/sharedStrings.xml", options).unwrap();
            zip.write_all(shared.as_bytes()).unwrap();
            for (i, sheet) in sheets.iter().enumerate() {
                zip.start_file(format!("xl/worksheets/sheet{}.xml", i + 1), options)
                    .unwrap();
                zip.write_all(sheet.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn size_guard_rejects_large_documents() {
        let err = normalize(b"0123456789", DocumentFormat::Text, 5).unwrap_err();
        assert!(matches!(err, ExtractError::TooLarge { size: 10, limit: 5 }));
        assert!(matches!(
            normalize(b"", DocumentFormat::Text, 5).unwrap_err(),
            ExtractError::Empty
        ));
    }

    #[test]
    fn text_is_normalized_and_fingerprinted() {
        let doc = normalize(b"\xEF\xBB\xBFLine one\r\nLine two", DocumentFormat::Text, 1024).unwrap();
        assert_eq!(doc.raw_text, "Line one\nLine two");
        assert_eq!(doc.byte_size, 21);
        assert_eq!(doc.source_id.len(), 64);
    }

    #[test]
    fn invalid_utf8_is_fatal() {
        let err = normalize(&[0xff, 0xfe, 0x00], DocumentFormat::Csv, 1024).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidUtf8("csv")));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", DocumentFormat::Pdf).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_xlsx() {
        let err = extract_text(b"not a zip", DocumentFormat::Excel).unwrap_err();
        assert!(matches!(err, ExtractError::Xlsx(_)));
    }

    #[test]
    fn csv_quotes_and_blank_lines() {
        let rows = parse_csv("a,b\n\"x, y\",\"say \"\"hi\"\"\"\n\nc,\n").unwrap();
        assert_eq!(
            rows,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["x, y".to_string(), "say \"hi\"".to_string()],
                vec![],
                vec!["c".to_string(), "".to_string()],
            ]
        );
    }

    #[test]
    fn csv_unterminated_quote_is_malformed() {
        let err = parse_csv("price,date\n\"950000,2024-01-01\n").unwrap_err();
        assert!(matches!(err, ExtractError::MalformedCsv { line: 2, .. }));
    }

    #[test]
    fn csv_tables_split_on_blank_lines() {
        let tables = csv_tables("h1,h2\n1,2\n\n\nk,v\nx,y\n").unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[1][0], vec!["k".to_string(), "v".to_string()]);
    }

    #[test]
    fn csv_line_quotes_when_needed() {
        let line = csv_line(&["plain".to_string(), "a,b".to_string(), "q\"".to_string()]);
        assert_eq!(line, "plain,\"a,b\",\"q\"\"\"");
    }

    #[test]
    fn xlsx_sheets_become_csv_blocks() {
        let shared = r#"<sst><si><t>Price</t></si><si><t>Date</t></si><si><r><t>Marina </t></r><r><t>Gate</t></r></si></sst>"#;
        let sheet1 = r#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c><c r="C1" t="inlineStr"><is><t>Property</t></is></c></row>
            <row r="2"><c r="A2"><v>950000</v></c><c r="B2" t="str"><v>2024-01-15</v></c><c r="C2" t="s"><v>2</v></c></row>
            <row r="3"><c r="A3"><v>700000</v></c><c r="C3" t="inlineStr"><is><t>Palm, Villa</t></is></c></row>
        </sheetData></worksheet>"#;
        let sheet2 = r#"<worksheet><sheetData><row r="1"><c r="B1" t="inlineStr"><is><t>Only</t></is></c></row></sheetData></worksheet>"#;
        let bytes = build_xlsx(shared, &[sheet1, sheet2]);

        let text = extract_text(&bytes, DocumentFormat::Excel).unwrap();
        assert_eq!(
            text,
            "Price,Date,Property\n950000,2024-01-15,Marina Gate\n700000,,\"Palm, Villa\"\n\n,Only"
        );
        let tables = csv_tables(&text).unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].len(), 3);
    }

    #[test]
    fn column_refs() {
        assert_eq!(column_index("A1").unwrap(), Some(0));
        assert_eq!(column_index("Z9").unwrap(), Some(25));
        assert_eq!(column_index("AB12").unwrap(), Some(27));
        assert_eq!(column_index("XFD1").unwrap(), Some(XLSX_MAX_COLUMNS - 1));
        assert_eq!(column_index("12").unwrap(), None);
        assert!(column_index("XFE1").is_err());
        assert!(column_index("AAAAAAAAAAAAAA1").is_err());
    }

    #[test]
    fn corrupt_cell_references_are_reported() {
        for cell in [r#"<c r="AAAAAAAAAAAAAA1"><v>1</v></c>"#, r#"<c r="ZZZZZZZ1"><v>1</v></c>"#, r#"<c r="XFE1"/>"#] {
            let sheet = format!(r#"<worksheet><sheetData><row r="1">{}</row></sheetData></worksheet>"#, cell);
            let bytes = build_xlsx("<sst/>", &[&sheet]);
            let err = extract_text(&bytes, DocumentFormat::Excel).unwrap_err();
            assert!(matches!(err, ExtractError::Xlsx(_)), "{cell}: {err}");
        }
    }

    #[test]
    fn sparse_wide_sheets_are_bounded() {
        let rows: String = (1..=200)
            .map(|r| format!(r#"<row r="{r}"><c r="XFD{r}"><v>1</v></c></row>"#))
            .collect();
        let sheet = format!("<worksheet><sheetData>{}</sheetData></worksheet>", rows);
        let bytes = build_xlsx("<sst/>", &[&sheet]);
        let err = extract_text(&bytes, DocumentFormat::Excel).unwrap_err();
        assert!(err.to_string().contains("limit"), "{err}");
    }
}
