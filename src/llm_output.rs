//! Extracción de objetos JSON embebidos en texto libre devuelto por el LLM.
//!
//! Los modelos suelen envolver el JSON en prosa o en bloques ```json; aquí se
//! localiza el primer objeto `{...}` equilibrado que además se puede parsear.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errores de salida mal formada del LLM.
#[derive(Debug, Error)]
pub enum LlmOutputError {
    #[error("la respuesta del modelo no contiene ningún objeto JSON válido")]
    NoJsonObject,
    #[error("el JSON del modelo no tiene la estructura esperada: {0}")]
    Schema(#[source] serde_json::Error),
}

/// Devuelve el primer objeto `{...}` equilibrado de `text` que parsea como JSON.
///
/// El escáner lleva la profundidad de anidamiento con una pila; dentro de un
/// tramo abierto ignora las llaves que aparecen en literales de cadena. Los
/// tramos equilibrados que no parsean se descartan y la búsqueda continúa.
pub fn first_json_object(text: &str) -> Result<Map<String, Value>, LlmOutputError> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, c) in text.char_indices() {
        if depth > 0 && in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            // Una llave de cierre sin apertura se ignora.
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(begin) = start.take() {
                        let candidate = &text[begin..=idx];
                        match serde_json::from_str::<Value>(candidate) {
                            Ok(Value::Object(map)) => return Ok(map),
                            Ok(_) | Err(_) => {
                                tracing::debug!("Descartado tramo JSON no válido: {candidate}");
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Err(LlmOutputError::NoJsonObject)
}

/// Extrae el primer objeto JSON y lo deserializa al tipo pedido.
pub fn parse_embedded<T: DeserializeOwned>(text: &str) -> Result<T, LlmOutputError> {
    let object = first_json_object(text)?;
    serde_json::from_value(Value::Object(object)).map_err(LlmOutputError::Schema)
}
