//! Normalización de títulos y nombres de fichero a segmentos de ruta seguros.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

const MAX_FILENAME_CHARS: usize = 255;

static STRIPPED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.,\-]").expect("regex válida"));
static FORBIDDEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/*?:"<>|]"#).expect("regex válida"));

/// Convierte un título arbitrario en un nombre de fichero válido.
///
/// Reglas, en orden: se eliminan puntos, comas y guiones; cada tramo de
/// espacios pasa a ser un único `_` salvo que vaya seguido de `&`, `(` o `)`.
/// En ese caso un espacio suelto precedido también de uno de ellos se conserva
/// y un tramo de varios queda en `__`. Después los caracteres
/// `\ / * ? : " < > |` se sustituyen por `_` y el resultado se corta a 255
/// caracteres. Nunca falla.
pub fn sanitize_filename(title: &str) -> String {
    let stripped = STRIPPED.replace_all(title, "");
    let collapsed = collapse_whitespace(&stripped);
    let replaced = FORBIDDEN.replace_all(&collapsed, "_");

    if replaced.chars().count() <= MAX_FILENAME_CHARS {
        return replaced.into_owned();
    }
    let truncated: String = replaced.chars().take(MAX_FILENAME_CHARS).collect();
    // El corte puede dejar un tramo de espacios al final que ya no está
    // flanqueado; se vuelve a colapsar para que el resultado sea estable.
    collapse_whitespace(&truncated)
}

/// Divide un nombre de fichero en (base saneada, extensión con punto).
pub fn sanitize_upload_name(file_name: &str) -> (String, String) {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (sanitize_filename(&stem), extension)
}

fn is_anchor(c: char) -> bool {
    matches!(c, '&' | '(' | ')')
}

fn collapse_whitespace(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_whitespace() {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        let before = start.checked_sub(1).map(|p| chars[p]);
        let after = chars.get(i).copied();
        if !after.is_some_and(is_anchor) {
            out.push('_');
        } else if i - start > 1 {
            // Todo el tramo menos el último espacio, y luego ese espacio.
            out.push_str("__");
        } else if before.is_some_and(is_anchor) {
            out.push(chars[start]);
        } else {
            out.push('_');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_title_example() {
        let (base, ext) = sanitize_upload_name("My Report (v2), Final.docx");
        assert_eq!(base, "My_Report_(v2)_Final");
        assert_eq!(ext, ".docx");
    }

    #[test]
    fn strips_punctuation_and_collapses_runs() {
        assert_eq!(sanitize_filename("a.b,c-d"), "abcd");
        assert_eq!(sanitize_filename("one   two\t\tthree"), "one_two_three");
        assert_eq!(sanitize_filename("  leading"), "_leading");
    }

    #[test]
    fn keeps_whitespace_between_anchor_characters() {
        assert_eq!(sanitize_filename("Q&A ) ( end"), "Q&A_) (_end");
        assert_eq!(sanitize_filename("(a) (b)"), "(a) (b)");
        assert_eq!(sanitize_filename("Tom & Jerry"), "Tom_&_Jerry");
    }

    #[test]
    fn long_runs_before_anchor_become_two_underscores() {
        assert_eq!(sanitize_filename("(a)   (b)"), "(a)__(b)");
        assert_eq!(sanitize_filename("Tom  (x)"), "Tom__(x)");
        assert_eq!(sanitize_filename("(a)   b"), "(a)_b");
    }

    #[test]
    fn replaces_forbidden_characters() {
        let out = sanitize_filename(r#"a\b/c*d?e:f"g<h>i|j"#);
        assert_eq!(out, "a_b_c_d_e_f_g_h_i_j");
        for c in ['\\', '/', '*', '?', ':', '"', '<', '>', '|'] {
            assert!(!out.contains(c));
        }
    }

    #[test]
    fn empty_input_gives_empty_output() {
        assert_eq!(sanitize_filename(""), "");
    }

    #[test]
    fn long_titles_are_truncated() {
        let long = "x".repeat(400);
        assert_eq!(sanitize_filename(&long).chars().count(), 255);

        let multibyte = "ñ".repeat(300);
        assert_eq!(sanitize_filename(&multibyte).chars().count(), 255);
    }

    #[test]
    fn sanitizing_is_idempotent() {
        let samples = [
            "My Report (v2), Final",
            "Q&A ) ( end",
            "  weird:: name ?? with <stuff>  ",
            "(a)   (b)",
            "",
        ];
        for sample in samples {
            let once = sanitize_filename(sample);
            assert_eq!(sanitize_filename(&once), once, "entrada: {sample:?}");
        }

        let mut boundary = "y".repeat(253);
        boundary.push_str("&   (");
        let once = sanitize_filename(&boundary);
        assert!(once.chars().count() <= 255);
        assert_eq!(sanitize_filename(&once), once);
    }
}
