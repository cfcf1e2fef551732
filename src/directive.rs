//! Directive payloads: structured-comment JSON blocks attached to grammar
//! nodes, plus the traversal context they ride on.
//!
//! Payloads stay insertion-ordered (`serde_json` with `preserve_order`) so
//! the `show` dump and generated artifacts are deterministic. Two control
//! keys are not directives: `PRESERVE` remembers the remaining payload under
//! a symbolic key scoped to the innermost named rule, `APPLY` re-materializes
//! it at another grammar fragment.

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{Error, Result};

pub type Payload = serde_json::Map<String, Value>;

/// Escape header marking a directive comment.
pub const DIRECTIVE_HEAD: &str = "VIRT:DIRECTIVE";

/// Deep merge: `source` keys override `target` scalars, object values merge
/// recursively. Shared by directive inheritance and define/use-site payload
/// combination.
pub fn deep_merge(target: &mut Payload, source: &Payload) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(t)), Value::Object(s)) => deep_merge(t, s),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// A payload remembered by `PRESERVE`, with the node-path depth at which it
/// was captured (that segment gets bracket-marked in derived locations).
#[derive(Debug, Clone)]
pub struct Preserved {
    pub anchor: usize,
    pub payload: Payload,
}

/// Directive state accumulated from the comments immediately preceding a
/// grammar element.
#[derive(Debug, Clone, Default)]
pub struct Pending {
    pub payload: Payload,
    /// Key under which the payload was remembered at this site.
    pub preserve: Option<String>,
    /// Remembered payloads introduced at this site.
    pub preserved: IndexMap<String, Preserved>,
    /// Anchor depth carried over from an applied payload.
    pub anchor: Option<usize>,
}

impl Pending {
    /// Fold one directive comment into the pending state. `ctx` is the
    /// enclosing context: it supplies the preserve scope and the anchor
    /// depth for newly remembered payloads.
    pub fn collect(&mut self, line: &str, ctx: &Ctx) -> Result<()> {
        let mut kvs: Payload = serde_json::from_str(line)
            .map_err(|e| Error::directive(format!("bad directive payload: {e}"), ctx.location()))?;

        if let Some(key) = kvs.shift_remove("PRESERVE") {
            let key = as_key(&key, "PRESERVE", ctx)?;
            self.preserved.insert(
                key.clone(),
                Preserved { anchor: ctx.nodepath.len(), payload: kvs },
            );
            self.preserve = Some(key);
        } else if let Some(key) = kvs.shift_remove("APPLY") {
            let key = as_key(&key, "APPLY", ctx)?;
            let preserved = self
                .preserved
                .get(&key)
                .or_else(|| ctx.preserve_table.get(&key))
                .ok_or_else(|| {
                    Error::directive(format!("no preserved payload '{key}'"), ctx.location())
                })?
                .clone();
            self.anchor = Some(preserved.anchor);
            deep_merge(&mut self.payload, &preserved.payload);
        } else {
            deep_merge(&mut self.payload, &kvs);
        }
        Ok(())
    }
}

fn as_key(value: &Value, which: &str, ctx: &Ctx) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::directive(format!("{which} key must be a string"), ctx.location()))
}

/// Lexical traversal context: where we are in the grammar and which
/// directives apply here. Cloned downward, never shared.
#[derive(Debug, Clone, Default)]
pub struct Ctx {
    /// `name` attribute of the current node (tag name in serialized form).
    pub id: String,
    /// Grammar node kind (`element`, `attribute`, `choice`, ...).
    pub tag: String,
    /// Grammar document this context derives from.
    pub rng: String,
    /// Innermost enclosing named rule.
    pub define: String,
    /// Derivation path segments under the rule: (name, kind suffix).
    pub nodepath: Vec<(String, String)>,
    /// Bracket-marked segment index, set through PRESERVE/APPLY.
    pub anchor: Option<usize>,
    /// Remembered payloads in scope.
    pub preserve_table: IndexMap<String, Preserved>,
    /// Key the current node asked to preserve under (forces rule
    /// re-evaluation on `ref`).
    pub preserve: Option<String>,
    /// Merged directive payload for the current node.
    pub payload: Payload,
}

impl Ctx {
    pub fn root(rng: &str) -> Self {
        Ctx { rng: rng.to_string(), ..Ctx::default() }
    }

    /// Child context for an element: inherits scope, extends the node path,
    /// and takes the pending directive state.
    pub fn child(&self, tag: &str, name: &str, data_type: Option<&str>, pending: Pending) -> Ctx {
        let mut ctx = Ctx {
            id: name.to_string(),
            tag: tag.to_string(),
            rng: self.rng.clone(),
            define: self.define.clone(),
            nodepath: self.nodepath.clone(),
            anchor: pending.anchor.or(self.anchor),
            preserve_table: self.preserve_table.clone(),
            preserve: pending.preserve,
            payload: pending.payload,
        };
        ctx.preserve_table.extend(pending.preserved);
        match tag {
            "choice" => ctx.nodepath.push((String::new(), "choice".to_string())),
            "data" => {
                let dtype = data_type.unwrap_or_default();
                ctx.nodepath.push((dtype.to_string(), ".data".to_string()));
            }
            _ if !name.is_empty() => {
                ctx.nodepath.push((name.to_string(), format!(".{tag}")))
            }
            _ => {}
        }
        ctx
    }

    /// Canonical derivation path: grammar file, named rule, node path, with
    /// the anchored segment bracket-marked. This is the pre-hash identity
    /// key for types.
    pub fn location(&self) -> String {
        let mut parts = vec![self.rng.clone(), format!("{}.define", self.define)];
        if !self.nodepath.is_empty() {
            let mut segments: Vec<String> = self
                .nodepath
                .iter()
                .map(|(name, suffix)| format!("{name}{suffix}"))
                .collect();
            if let Some(anchor) = self.anchor {
                if anchor < segments.len() {
                    segments[anchor] = format!("[{}]", segments[anchor]);
                }
            }
            parts.extend(segments);
        }
        format!("/{}", parts.join("/"))
    }

    /// Default C type name derived from the node path (or the rule name at
    /// a rule's top level), with the project prefix enforced.
    pub fn fullname(&self) -> String {
        let base = if self.nodepath.is_empty() {
            self.define.clone()
        } else {
            self.nodepath
                .iter()
                .map(|(name, _)| crate::terms::upper_initial(name))
                .collect()
        };
        if base.starts_with("vir") {
            base
        } else {
            format!("vir{}", crate::terms::upper_initial(&base))
        }
    }

    /// Rewrite the pending member identity in place (used by `anyName` and
    /// `name` children, which rename their enclosing node).
    pub fn rename(&mut self, name: &str) {
        self.id = name.to_string();
        self.nodepath.push((name.to_string(), format!(".{}", self.tag)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Payload {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn deep_merge_overrides_scalars_and_merges_objects() {
        let mut target = obj(json!({ "opt": false, "parse": { "default": "0" } }));
        let source = obj(json!({ "opt": true, "parse": { "instname": "net" } }));
        deep_merge(&mut target, &source);
        assert_eq!(
            Value::Object(target),
            json!({ "opt": true, "parse": { "default": "0", "instname": "net" } })
        );
    }

    #[test]
    fn preserve_then_apply_round_trips_byte_identically() {
        let ctx = Ctx::root("net.rng");
        let body = r#"{ "pointer": true, "parse": { "instname": "server" } }"#;

        // Inline application.
        let mut inline = Pending::default();
        inline.collect(body, &ctx).unwrap();

        // PRESERVE at one site, APPLY at another.
        let mut site = Pending::default();
        site.collect(&format!(r#"{{ "PRESERVE": "srv", {}"#, &body[1..]), &ctx).unwrap();
        let mut scope = ctx.clone();
        scope.preserve_table.extend(site.preserved.clone());
        let mut applied = Pending::default();
        applied.collect(r#"{ "APPLY": "srv" }"#, &scope).unwrap();

        assert_eq!(
            serde_json::to_string(&inline.payload).unwrap(),
            serde_json::to_string(&applied.payload).unwrap()
        );
    }

    #[test]
    fn apply_of_unknown_key_is_fatal() {
        let ctx = Ctx::root("net.rng");
        let mut pending = Pending::default();
        let err = pending.collect(r#"{ "APPLY": "nope" }"#, &ctx).unwrap_err();
        assert!(err.to_string().contains("no preserved payload 'nope'"));
    }

    #[test]
    fn location_brackets_the_anchored_segment() {
        let mut ctx = Ctx::root("net.rng");
        ctx.define = "forward".to_string();
        ctx.nodepath = vec![
            ("nat".to_string(), ".element".to_string()),
            ("port".to_string(), ".element".to_string()),
        ];
        ctx.anchor = Some(1);
        assert_eq!(ctx.location(), "/net.rng/forward.define/nat.element/[port.element]");
    }

    #[test]
    fn fullname_gets_the_project_prefix() {
        let mut ctx = Ctx::root("net.rng");
        ctx.define = "bridge".to_string();
        assert_eq!(ctx.fullname(), "virBridge");
        ctx.nodepath = vec![
            ("dns".to_string(), ".element".to_string()),
            ("host".to_string(), ".element".to_string()),
        ];
        assert_eq!(ctx.fullname(), "virDNSHost");
    }
}
