use crate::band::ModuleKind;
use crate::ipc::types::Request;

/// Trimmed, non-empty string param.
pub fn param_str<'a>(req: &'a Request, key: &str) -> Option<&'a str> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Optional module filter. `Err` carries the message for a bad value.
pub fn param_module(req: &Request, key: &str) -> Result<Option<ModuleKind>, String> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(format!("{} must be 'reading' or 'listening'", key));
            };
            ModuleKind::parse(s)
                .map(Some)
                .ok_or_else(|| format!("{} must be 'reading' or 'listening'", key))
        }
    }
}
