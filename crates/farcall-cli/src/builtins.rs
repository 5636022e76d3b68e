//! Built-in function set
//!
//! Functions the `farcall` server resolves by qualified name. The geometry
//! functions work on 4x4 homogeneous matrices stored row-major as nested
//! lists, and on points given as `[x, y, z]` lists.

use async_trait::async_trait;
use farcall_core::codec::{Map, Value};
use farcall_core::function::{required_arg, CallContext, FunctionError, FunctionRegistry, RemoteFunction};
use std::time::Duration;

type Matrix = [[f64; 4]; 4];

/// Registry with every built-in function
pub fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register_package("farcall-builtins", env!("CARGO_PKG_VERSION"))
        .register_fn("builtin.echo", |args, _kwargs| Ok(Value::List(args)))
        .register_fn("builtin.sum", sum)
        .register_fn("builtin.fail", |args, _kwargs| {
            let message = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("failure requested")
                .to_string();
            Err(FunctionError::Failed(message))
        })
        .register_fn("geometry.translation", translation)
        .register_fn("geometry.transform_points", transform_points)
        .register("builtin.map_callback", MapCallback)
        .register("builtin.sleep", Sleep);
    registry
}

fn sum(args: Vec<Value>, _kwargs: Map) -> Result<Value, FunctionError> {
    let mut int_total: i64 = 0;
    let mut float_total = 0.0;
    let mut all_ints = true;

    for (index, arg) in args.iter().enumerate() {
        match arg {
            Value::Int(i) => {
                int_total = int_total.saturating_add(*i);
                float_total += *i as f64;
            }
            Value::Float(f) => {
                all_ints = false;
                float_total += f;
            }
            other => {
                return Err(FunctionError::invalid_arguments(format!(
                    "argument {index} is not a number: {other:?}"
                )))
            }
        }
    }

    Ok(if all_ints {
        Value::Int(int_total)
    } else {
        Value::Float(float_total)
    })
}

/// `translation(offset)` - matrix moving points by `[dx, dy, dz]`
fn translation(args: Vec<Value>, _kwargs: Map) -> Result<Value, FunctionError> {
    let [dx, dy, dz] = point(required_arg(&args, 0, "offset")?)?;
    let mut matrix = identity();
    matrix[0][3] = dx;
    matrix[1][3] = dy;
    matrix[2][3] = dz;
    Ok(matrix_value(&matrix))
}

/// `transform_points(points, matrix)`
fn transform_points(args: Vec<Value>, kwargs: Map) -> Result<Value, FunctionError> {
    let points = required_arg(&args, 0, "points")?
        .as_list()
        .ok_or_else(|| FunctionError::invalid_arguments("`points` must be a list"))?;
    let matrix = match args.get(1).or_else(|| kwargs.get("matrix")) {
        Some(value) => parse_matrix(value)?,
        None => return Err(FunctionError::invalid_arguments("missing argument `matrix`")),
    };

    let transformed = points
        .iter()
        .map(|p| -> Result<Value, FunctionError> {
            let [x, y, z] = point(p)?;
            let apply = |row: &[f64; 4]| row[0] * x + row[1] * y + row[2] * z + row[3];
            Ok(Value::list(vec![apply(&matrix[0]), apply(&matrix[1]), apply(&matrix[2])]))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::List(transformed))
}

/// `map_callback(callback, items)` - call the client's callback on every item
struct MapCallback;

#[async_trait]
impl RemoteFunction for MapCallback {
    async fn call(
        &self,
        ctx: &mut CallContext<'_>,
        args: Vec<Value>,
        _kwargs: Map,
    ) -> Result<Value, FunctionError> {
        let Value::Callback(id) = required_arg(&args, 0, "callback")? else {
            return Err(FunctionError::invalid_arguments("`callback` must be a client callable"));
        };
        let id = *id;
        let items = required_arg(&args, 1, "items")?
            .as_list()
            .ok_or_else(|| FunctionError::invalid_arguments("`items` must be a list"))?
            .to_vec();

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            results.push(ctx.invoke_callback(id, vec![item], Map::new()).await?);
        }
        Ok(Value::List(results))
    }
}

/// `sleep(ms)` - wait, reporting progress through the call context
struct Sleep;

#[async_trait]
impl RemoteFunction for Sleep {
    async fn call(
        &self,
        ctx: &mut CallContext<'_>,
        args: Vec<Value>,
        _kwargs: Map,
    ) -> Result<Value, FunctionError> {
        let ms = required_arg(&args, 0, "ms")?
            .as_i64()
            .filter(|ms| *ms >= 0)
            .ok_or_else(|| FunctionError::invalid_arguments("`ms` must be a non-negative integer"))?;

        ctx.log(format!("sleeping for {ms} ms")).await;
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        ctx.log("awake").await;
        Ok(Value::Int(ms))
    }
}

fn identity() -> Matrix {
    let mut matrix = [[0.0; 4]; 4];
    for (i, row) in matrix.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    matrix
}

fn matrix_value(matrix: &Matrix) -> Value {
    Value::list(matrix.iter().map(|row| Value::list(row.to_vec())))
}

fn number(value: &Value) -> Result<f64, FunctionError> {
    value
        .as_f64()
        .ok_or_else(|| FunctionError::invalid_arguments(format!("expected a number, got {value:?}")))
}

fn point(value: &Value) -> Result<[f64; 3], FunctionError> {
    match value.as_list() {
        Some([x, y, z]) => Ok([number(x)?, number(y)?, number(z)?]),
        _ => Err(FunctionError::invalid_arguments(format!(
            "expected a point [x, y, z], got {value:?}"
        ))),
    }
}

fn parse_matrix(value: &Value) -> Result<Matrix, FunctionError> {
    let invalid = || FunctionError::invalid_arguments("`matrix` must be a 4x4 list of numbers");
    let rows = value.as_list().filter(|rows| rows.len() == 4).ok_or_else(invalid)?;

    let mut matrix = [[0.0; 4]; 4];
    for (target, row) in matrix.iter_mut().zip(rows) {
        let cells = row.as_list().filter(|cells| cells.len() == 4).ok_or_else(invalid)?;
        for (cell, value) in target.iter_mut().zip(cells) {
            *cell = number(value)?;
        }
    }
    Ok(matrix)
}
