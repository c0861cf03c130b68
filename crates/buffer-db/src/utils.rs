use prettytable::{Cell, Row, Table};
use serde_json::Value;

/// Print a collection of JSON objects as an ASCII table
pub fn print_json_objects_as_table(json_objects: &[Value]) {
    let Some(Value::Object(first_obj)) = json_objects.first() else {
        println!("No data to display.");
        return;
    };

    let mut table = Table::new();

    // headers come from the first object
    let headers: Vec<&str> = first_obj.keys().map(|k| k.as_str()).collect();
    table.add_row(Row::new(
        headers.iter().map(|&header| Cell::new(header)).collect(),
    ));

    for json_obj in json_objects {
        if let Value::Object(obj) = json_obj {
            let row_values: Vec<String> = headers
                .iter()
                .map(|key| {
                    obj.get(*key)
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "NULL".to_string())
                })
                .collect();
            table.add_row(Row::new(
                row_values.iter().map(|value| Cell::new(value)).collect(),
            ));
        }
    }

    table.printstd();
}
