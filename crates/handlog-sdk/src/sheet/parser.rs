//! 行解析器
//!
//! 保守的 CSV 方言解析：支持双引号字段中的逗号和转义引号（`""` → `"`），
//! 不支持引号内换行。每个字段两端空白会被去掉。
//!
//! 空行会被跳过，但**不占用**输出序号以外的任何东西：`row_number` 始终是
//! 该行在原文中的 1-based 行号，与表格的物理行一一对应。

use serde_json::Value;
use std::iter::Enumerate;
use std::str::Split;

/// 一行原始单元格，列的含义由位置决定
pub type RawRow = Vec<String>;

/// 带源行号的解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRow {
    /// 源文本中的 1-based 行号
    pub row_number: usize,
    pub cells: RawRow,
}

/// 解析单行
pub fn parse_line(line: &str) -> RawRow {
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if in_quotes && chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = !in_quotes;
                }
            }
            ',' if !in_quotes => {
                row.push(field.trim().to_string());
                field.clear();
            }
            _ => field.push(c),
        }
    }
    row.push(field.trim().to_string());

    row
}

/// 惰性行迭代器（见 [`parse_rows`]）
pub struct RowIter<'a> {
    lines: Enumerate<Split<'a, char>>,
}

impl<'a> Iterator for RowIter<'a> {
    type Item = ParsedRow;

    fn next(&mut self) -> Option<Self::Item> {
        for (index, line) in self.lines.by_ref() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            return Some(ParsedRow {
                row_number: index + 1,
                cells: parse_line(line),
            });
        }
        None
    }
}

/// 惰性解析整段文本
pub fn iter_rows(text: &str) -> RowIter<'_> {
    RowIter {
        lines: text.split('\n').enumerate(),
    }
}

/// 解析整段文本
pub fn parse_rows(text: &str) -> Vec<ParsedRow> {
    iter_rows(text).collect()
}

/// 从 full-data 响应里的 JSON 负载提取行
///
/// 接受二维数组 `[[..], [..]]`，或包含 `rows` / `values` 二维数组的对象。
/// 数组下标 + 1 即行号；空行跳过但保留编号。无法识别的结构返回 None。
pub fn rows_from_json(data: &Value) -> Option<Vec<ParsedRow>> {
    let rows = match data {
        Value::Array(rows) => rows,
        Value::Object(map) => match map.get("rows").or_else(|| map.get("values")) {
            Some(Value::Array(rows)) => rows,
            _ => return None,
        },
        _ => return None,
    };

    let mut parsed = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let Value::Array(cells) = row else {
            return None;
        };

        let cells: RawRow = cells.iter().map(cell_to_string).collect();
        if cells.iter().all(|c| c.is_empty()) {
            continue;
        }

        parsed.push(ParsedRow {
            row_number: index + 1,
            cells,
        });
    }

    Some(parsed)
}

fn cell_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_line_quotes() {
        let row = parse_line(r#"1,"10:14","Seat 3, button","say ""hi""",  done "#);
        assert_eq!(row, vec!["1", "10:14", "Seat 3, button", r#"say "hi""#, "done"]);
    }

    #[test]
    fn test_parse_line_empty_fields() {
        assert_eq!(parse_line(",,"), vec!["", "", ""]);
        assert_eq!(parse_line("a"), vec!["a"]);
    }

    #[test]
    fn test_row_numbers_follow_source_lines() {
        let text = "header,time\r\n\r\n1,10:14\n\n   \n2,10:18\r\n";
        let rows = parse_rows(text);
        let numbers: Vec<usize> = rows.iter().map(|r| r.row_number).collect();
        assert_eq!(numbers, vec![1, 3, 6]);
        assert_eq!(rows[2].cells, vec!["2", "10:18"]);
    }

    #[test]
    fn test_leading_blank_lines_keep_ordinals() {
        let rows = parse_rows("\n\nx,y");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_number, 3);
    }

    #[test]
    fn test_iter_rows_is_lazy() {
        let mut iter = iter_rows("a\n\nb\nc");
        assert_eq!(iter.next().map(|r| r.row_number), Some(1));
        assert_eq!(iter.next().map(|r| r.row_number), Some(3));
    }

    #[test]
    fn test_rows_from_json() {
        let data = json!({"rows": [["", "138", "10:18", "", "미완료"], [null, null], ["", 139, "10:22"]]});
        let rows = rows_from_json(&data).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_number, 1);
        assert_eq!(rows[1].row_number, 3);
        assert_eq!(rows[1].cells[1], "139");

        assert!(rows_from_json(&json!({"foo": 1})).is_none());
        assert!(rows_from_json(&json!([1, 2])).is_none());
    }
}
