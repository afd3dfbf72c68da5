//! JSON schema to GBNF grammar conversion.
//!
//! Covers the subset used for structured output and tool arguments:
//! `type` (object, array, string, number, integer, boolean, null, or a list
//! of these), `properties`, `required`, `items`, `minItems`, `maxItems`,
//! `enum`, `const`, `anyOf`, `oneOf` and local `$ref`s. Anything else that
//! would change the accepted language is rejected instead of ignored.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::{ChatError, Result};

const PRIMITIVES: &[(&str, &str, &[&str])] = &[
    ("ws", r#"[ \t\n]*"#, &[]),
    (
        "char",
        r#"[^"\\\x7F\x00-\x1F] | "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F])"#,
        &[],
    ),
    ("string", r#""\"" char* "\"""#, &["char"]),
    ("integer", r#""-"? ("0" | [1-9] [0-9]*)"#, &[]),
    ("number", r#"integer ("." [0-9]+)? ([eE] [-+]? [0-9]+)?"#, &["integer"]),
    ("boolean", r#""true" | "false""#, &[]),
    ("null", r#""null""#, &[]),
    (
        "value",
        "object | array | string | number | boolean | null",
        &["object", "array", "string", "number", "boolean", "null"],
    ),
    (
        "object",
        r#""{" ws ( string ws ":" ws value ( ws "," ws string ws ":" ws value )* )? ws "}""#,
        &["ws", "string", "value"],
    ),
    (
        "array",
        r#""[" ws ( value ( ws "," ws value )* )? ws "]""#,
        &["ws", "value"],
    ),
];

/// Convert a JSON schema into a GBNF grammar whose root matches conforming JSON.
pub fn json_schema_to_grammar(schema: &Value) -> Result<String> {
    let mut converter = SchemaConverter::new();
    converter.set_root(schema, "");
    let name = converter.visit(schema, "root")?;
    converter.finish(&name)
}

/// Quote text as a GBNF literal.
pub(crate) fn gbnf_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7F => {
                out.push_str(&format!("\\x{:02X}", c as u32))
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Literal matching the JSON encoding of `value`.
pub(crate) fn json_literal(value: &Value) -> String {
    gbnf_literal(&value.to_string())
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "rule".to_string()
    } else {
        cleaned
    }
}

/// Builds grammar rules from one or more schemas.
pub(crate) struct SchemaConverter<'a> {
    rules: Vec<(String, String)>,
    names: HashSet<String>,
    refs: HashMap<String, String>,
    root: Option<&'a Value>,
    scope: String,
}

impl<'a> SchemaConverter<'a> {
    pub(crate) fn new() -> Self {
        let mut names = HashSet::new();
        names.insert("root".to_string());
        Self {
            rules: Vec::new(),
            names,
            refs: HashMap::new(),
            root: None,
            scope: String::new(),
        }
    }

    /// Document that local `$ref`s resolve against; `scope` keeps refs of
    /// different documents apart.
    pub(crate) fn set_root(&mut self, root: &'a Value, scope: &str) {
        self.root = Some(root);
        self.scope = scope.to_string();
    }

    /// Emit the grammar with `root ::= root_expr` first.
    pub(crate) fn finish(self, root_expr: &str) -> Result<String> {
        let mut out = String::new();
        if root_expr != "root" {
            out.push_str(&format!("root ::= {}\n", root_expr));
        }
        for (name, body) in &self.rules {
            if name == "root" {
                out.insert_str(0, &format!("root ::= {}\n", body));
            } else {
                out.push_str(&format!("{} ::= {}\n", name, body));
            }
        }
        Ok(out)
    }

    /// Add a rule under a fresh name derived from `hint`.
    pub(crate) fn add_rule(&mut self, hint: &str, body: String) -> String {
        let base = sanitize(hint);
        let mut name = base.clone();
        let mut n = 1;
        while self.names.contains(&name) && !(name == "root" && !self.has_rule("root")) {
            name = format!("{}-{}", base, n);
            n += 1;
        }
        self.names.insert(name.clone());
        self.rules.push((name.clone(), body));
        name
    }

    fn has_rule(&self, name: &str) -> bool {
        self.rules.iter().any(|(n, _)| n == name)
    }

    pub(crate) fn primitive(&mut self, name: &str) -> String {
        if self.has_rule(name) {
            return name.to_string();
        }
        if let Some((_, body, deps)) = PRIMITIVES.iter().find(|(n, _, _)| *n == name) {
            self.names.insert(name.to_string());
            self.rules.push((name.to_string(), body.to_string()));
            for dep in deps.iter() {
                self.primitive(dep);
            }
        }
        name.to_string()
    }

    /// Rule name matching `schema`.
    pub(crate) fn visit(&mut self, schema: &'a Value, hint: &str) -> Result<String> {
        let obj = match schema {
            Value::Bool(true) => return Ok(self.primitive("value")),
            Value::Object(obj) => obj,
            other => {
                return Err(ChatError::Schema(format!(
                    "schema must be an object, got {}",
                    other
                )))
            }
        };

        if let Some(reference) = obj.get("$ref") {
            let reference = reference
                .as_str()
                .ok_or_else(|| ChatError::Schema("$ref must be a string".to_string()))?;
            return self.visit_ref(reference);
        }

        if let Some(value) = obj.get("const") {
            return Ok(self.add_rule(hint, json_literal(value)));
        }

        if let Some(values) = obj.get("enum") {
            let values = values
                .as_array()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ChatError::Schema("enum must be a non-empty array".to_string()))?;
            let body = values.iter().map(json_literal).collect::<Vec<_>>().join(" | ");
            return Ok(self.add_rule(hint, body));
        }

        for key in ["anyOf", "oneOf"] {
            if let Some(options) = obj.get(key) {
                let options = options
                    .as_array()
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| ChatError::Schema(format!("{} must be a non-empty array", key)))?;
                let mut alts = Vec::with_capacity(options.len());
                for (i, option) in options.iter().enumerate() {
                    alts.push(self.visit(option, &format!("{}-{}", hint, i))?);
                }
                return Ok(self.add_rule(hint, alts.join(" | ")));
            }
        }

        match obj.get("type") {
            Some(Value::String(ty)) => self.visit_type(schema, ty, hint),
            Some(Value::Array(types)) => {
                let mut alts = Vec::with_capacity(types.len());
                for ty in types {
                    let ty = ty
                        .as_str()
                        .ok_or_else(|| ChatError::Schema("type list must hold strings".to_string()))?;
                    alts.push(self.visit_type(schema, ty, hint)?);
                }
                if alts.is_empty() {
                    return Err(ChatError::Schema("empty type list".to_string()));
                }
                Ok(self.add_rule(hint, alts.join(" | ")))
            }
            Some(other) => Err(ChatError::Schema(format!("invalid type {}", other))),
            None if obj.contains_key("properties") => self.visit_type(schema, "object", hint),
            None if obj.contains_key("items") => self.visit_type(schema, "array", hint),
            None => Ok(self.primitive("value")),
        }
    }

    fn visit_type(&mut self, schema: &'a Value, ty: &str, hint: &str) -> Result<String> {
        match ty {
            "string" | "number" | "integer" | "boolean" | "null" => Ok(self.primitive(ty)),
            "object" => self.visit_object(schema, hint),
            "array" => self.visit_array(schema, hint),
            other => Err(ChatError::Schema(format!("unsupported type '{}'", other))),
        }
    }

    fn visit_object(&mut self, schema: &'a Value, hint: &str) -> Result<String> {
        let Some(properties) = schema.get("properties") else {
            return Ok(self.primitive("object"));
        };
        let properties = properties
            .as_object()
            .ok_or_else(|| ChatError::Schema("properties must be an object".to_string()))?;

        let required: Vec<&str> = match schema.get("required") {
            None => Vec::new(),
            Some(Value::Array(names)) => names
                .iter()
                .map(|n| {
                    n.as_str()
                        .ok_or_else(|| ChatError::Schema("required must list strings".to_string()))
                })
                .collect::<Result<Vec<&str>>>()?,
            Some(_) => return Err(ChatError::Schema("required must be an array".to_string())),
        };
        if let Some(missing) = required.iter().find(|r| !properties.contains_key(**r)) {
            return Err(ChatError::Schema(format!(
                "required property '{}' is not defined",
                missing
            )));
        }

        let ws = self.primitive("ws");
        let mut mandatory = Vec::new();
        let mut optional = Vec::new();
        for (key, prop) in properties {
            let value = self.visit(prop, &format!("{}-{}", hint, key))?;
            let kv = format!(
                "{} {ws} \":\" {ws} {}",
                json_literal(&Value::String(key.clone())),
                value
            );
            if required.contains(&key.as_str()) {
                mandatory.push(kv);
            } else {
                optional.push(kv);
            }
        }

        let comma = format!("{ws} \",\" {ws}");
        let trailing = |kvs: &[String]| -> String {
            kvs.iter()
                .map(|kv| format!(" ( {comma} {kv} )?"))
                .collect::<String>()
        };
        let body = if !mandatory.is_empty() {
            format!("{}{}", mandatory.join(&format!(" {comma} ")), trailing(&optional))
        } else if !optional.is_empty() {
            let alts: Vec<String> = (0..optional.len())
                .map(|i| format!("{}{}", optional[i], trailing(&optional[i + 1..])))
                .collect();
            format!("( {} )?", alts.join(" | "))
        } else {
            String::new()
        };

        Ok(self.add_rule(hint, format!("\"{{\" {ws} {body} {ws} \"}}\"")))
    }

    fn visit_array(&mut self, schema: &'a Value, hint: &str) -> Result<String> {
        let item = match schema.get("items") {
            Some(items) => self.visit(items, &format!("{}-item", hint))?,
            None => self.primitive("value"),
        };
        let bound = |key: &str| -> Result<Option<usize>> {
            match schema.get(key) {
                None => Ok(None),
                Some(v) => v
                    .as_u64()
                    .map(|n| Some(n as usize))
                    .ok_or_else(|| ChatError::Schema(format!("{} must be a non-negative integer", key))),
            }
        };
        let min = bound("minItems")?.unwrap_or(0);
        let max = bound("maxItems")?;
        if max.is_some_and(|max| max < min) {
            return Err(ChatError::Schema("maxItems is below minItems".to_string()));
        }

        let ws = self.primitive("ws");
        let next = format!("{ws} \",\" {ws} {item}");
        // `count` more separated items, at least `min_rest`.
        let tail = |min_rest: usize, max_rest: Option<usize>| -> String {
            let mut parts = vec![next.clone(); min_rest];
            match max_rest {
                None => parts.push(format!("( {next} )*")),
                Some(max_rest) => {
                    let mut nested = String::new();
                    for _ in min_rest..max_rest {
                        nested = if nested.is_empty() {
                            format!("( {next} )?")
                        } else {
                            format!("( {next} {nested} )?")
                        };
                    }
                    if !nested.is_empty() {
                        parts.push(nested);
                    }
                }
            }
            parts.join(" ")
        };

        let body = match max {
            Some(0) => String::new(),
            _ if min >= 1 => format!("{item} {}", tail(min - 1, max.map(|m| m - 1))),
            _ => format!("( {item} {} )?", tail(0, max.map(|m| m - 1))),
        };
        Ok(self.add_rule(hint, format!("\"[\" {ws} {body} {ws} \"]\"")))
    }

    fn visit_ref(&mut self, reference: &str) -> Result<String> {
        let key = format!("{}{}", self.scope, reference);
        if let Some(name) = self.refs.get(&key) {
            return Ok(name.clone());
        }
        let root = self
            .root
            .ok_or_else(|| ChatError::Schema(format!("unresolvable $ref '{}'", reference)))?;

        let (target, def_name) = if reference == "#" {
            (root, "self")
        } else {
            let def = reference
                .strip_prefix("#/$defs/")
                .or_else(|| reference.strip_prefix("#/definitions/"))
                .ok_or_else(|| ChatError::Schema(format!("unsupported $ref '{}'", reference)))?;
            let container = if reference.starts_with("#/$defs/") {
                "$defs"
            } else {
                "definitions"
            };
            let target = root
                .get(container)
                .and_then(|defs| defs.get(def))
                .ok_or_else(|| ChatError::Schema(format!("unresolved $ref '{}'", reference)))?;
            (target, def)
        };

        // Reserve the name first so recursive references terminate.
        let name = self.add_rule(&format!("{}ref-{}", self.scope, def_name), String::new());
        self.refs.insert(key, name.clone());
        let body = self.visit(target, &format!("{}-body", name))?;
        if let Some(rule) = self.rules.iter_mut().find(|(n, _)| *n == name) {
            rule.1 = body;
        }
        Ok(name)
    }
}
