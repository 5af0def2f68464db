//! `{{macro}}` substitution.
//!
//! Macros are written `{{name}}` or `{{name::arg::arg}}`. Arguments are
//! expanded before the macro itself, replacements are never re-scanned, and
//! unknown macros are left in the text untouched. Variable macros are the only
//! side effects and only touch the variable stores handed to the engine.

use chrono::{DateTime, FixedOffset, Local};
use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;

use super::types::{Character, GroupContext, Message, Role};
use super::variables::{VarAccess, VarWrite, VariableStore};
use crate::utils::{seeded_rng, truncate_for_log};

const TRIM_MARK: &str = "\u{E000}";

lazy_static! {
    static ref TRIM_RE: Regex = Regex::new(r"\s*\x{E000}\s*").expect("static regex");
    static ref DICE_RE: Regex =
        Regex::new(r"(?i)^(\d*)d(\d+)\s*(?:([+-])\s*(\d+))?$").expect("static regex");
}

/// Everything the built-in macros read from. Borrowed for one generation.
#[derive(Debug, Clone, Default)]
pub struct MacroContext<'a> {
    pub user: &'a str,
    pub persona_description: &'a str,
    /// The character currently speaking.
    pub character: Option<&'a Character>,
    pub group: Option<&'a GroupContext>,
    pub model: Option<&'a str>,
    pub max_prompt: u32,
    pub summary: &'a str,
    pub history: &'a [&'a Message],
    pub chat_id: &'a str,
    /// Clock used by time macros; `None` reads the local clock.
    pub now: Option<DateTime<FixedOffset>>,
}

impl<'a> MacroContext<'a> {
    fn char_name(&self) -> &str {
        match (self.character, self.group) {
            (Some(c), _) => c.name.as_str(),
            (None, Some(g)) => g.group.name.as_str(),
            (None, None) => "",
        }
    }

    fn group_names(&self, only_enabled: bool) -> String {
        match self.group {
            Some(g) if only_enabled => g.enabled_members().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", "),
            Some(g) => g.member_names().join(", "),
            None => self.char_name().to_string(),
        }
    }

    fn not_char(&self) -> String {
        let current = self.character.map(|c| c.id.as_str());
        let mut names: Vec<&str> = vec![self.user];
        if let Some(g) = self.group {
            names.extend(
                g.members
                    .iter()
                    .filter(|c| Some(c.id.as_str()) != current)
                    .map(|c| c.name.as_str()),
            );
        }
        names.retain(|n| !n.is_empty());
        names.join(", ")
    }

    fn last_with_role(&self, role: Option<Role>) -> Option<&Message> {
        self.history
            .iter()
            .rev()
            .find(|m| role.map_or(true, |r| m.role == r))
            .copied()
    }

    fn field(&self, pick: impl Fn(&Character) -> &str) -> String {
        self.character.map(|c| pick(c).to_string()).unwrap_or_default()
    }

    fn now(&self) -> DateTime<FixedOffset> {
        self.now.unwrap_or_else(|| Local::now().into())
    }
}

pub struct MacroEngine<'a, 'v> {
    ctx: &'a MacroContext<'a>,
    locals: &'v mut VariableStore,
    globals: &'v mut VariableStore,
    occurrence: usize,
}

impl<'a, 'v> MacroEngine<'a, 'v> {
    pub fn new(
        ctx: &'a MacroContext<'a>,
        locals: &'v mut VariableStore,
        globals: &'v mut VariableStore,
    ) -> Self {
        Self {
            ctx,
            locals,
            globals,
            occurrence: 0,
        }
    }

    /// Count of macros seen so far; random picks are seeded from it.
    pub fn occurrence(&self) -> usize {
        self.occurrence
    }

    /// Continues numbering from an earlier engine over the same context.
    pub fn starting_at(mut self, occurrence: usize) -> Self {
        self.occurrence = occurrence;
        self
    }

    pub fn evaluate(&mut self, text: &str) -> String {
        if !text.contains("{{") {
            return text.to_string();
        }
        let rendered = self.render(text);
        if rendered.contains(TRIM_MARK) {
            TRIM_RE.replace_all(&rendered, "").into_owned()
        } else {
            rendered
        }
    }

    fn render(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = find_closing(after) else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };

            let inner = &after[..end];
            if inner.trim_start().starts_with("//") {
                rest = &after[end + 2..];
                continue;
            }

            let evaluated = self.render(inner);
            match self.expand(&evaluated) {
                Some(replacement) => out.push_str(&replacement),
                None => {
                    tracing::trace!(target: "macros", token = %truncate_for_log(&evaluated, 40), "unknown macro left verbatim");
                    out.push_str("{{");
                    out.push_str(&evaluated);
                    out.push_str("}}");
                }
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }

    fn expand(&mut self, inner: &str) -> Option<String> {
        self.occurrence += 1;
        let trimmed = inner.trim();

        let (name, args): (String, Vec<&str>) = if let Some((name, tail)) = trimmed.split_once("::") {
            (name.trim().to_lowercase(), tail.split("::").collect())
        } else if let Some((name, tail)) = trimmed.split_once(':') {
            (name.trim().to_lowercase(), tail.split(',').map(str::trim).collect())
        } else {
            (trimmed.to_lowercase(), Vec::new())
        };

        if let Some(value) = self.expand_variable(&name, &args) {
            return Some(value);
        }

        let ctx = self.ctx;
        let value = match name.as_str() {
            "user" | "persona" | "user.name" | "persona.name" | "user_name" | "persona_name" => {
                ctx.user.to_string()
            }
            "char" | "char.name" | "ai_name" => ctx.char_name().to_string(),
            "charifnotgroup" => match ctx.group {
                Some(_) => ctx.group_names(false),
                None => ctx.char_name().to_string(),
            },
            "group" => ctx.group_names(false),
            "groupnotmuted" => ctx.group_names(true),
            "notchar" => ctx.not_char(),
            "description" | "char.desc" | "ai_description" => ctx.field(|c| &c.description),
            "personality" => ctx.field(|c| &c.personality),
            "scenario" => ctx.field(|c| &c.scenario),
            "mesexamples" | "mesexamplesraw" => ctx.field(|c| &c.mes_example),
            "persona.desc" | "user.desc" | "persona_description" | "user_description" => {
                ctx.persona_description.to_string()
            }
            "summary" => ctx.summary.to_string(),
            "model" => ctx.model.unwrap_or_default().to_string(),
            "maxprompt" => ctx.max_prompt.to_string(),
            "lastmessage" | "lastchatmessage" => ctx
                .last_with_role(None)
                .map(|m| m.text_content())
                .unwrap_or_default(),
            "lastmessageid" => ctx
                .last_with_role(None)
                .map(|m| m.id.to_string())
                .unwrap_or_default(),
            "lastusermessage" => ctx
                .last_with_role(Some(Role::User))
                .map(|m| m.text_content())
                .unwrap_or_default(),
            "lastcharmessage" => ctx
                .last_with_role(Some(Role::Assistant))
                .map(|m| m.text_content())
                .unwrap_or_default(),
            "newline" => "\n".to_string(),
            "trim" => TRIM_MARK.to_string(),
            "noop" => String::new(),
            "time" => ctx.now().format("%-I:%M %p").to_string(),
            "date" => ctx.now().format("%B %-d, %Y").to_string(),
            "weekday" => ctx.now().format("%A").to_string(),
            "isotime" => ctx.now().format("%H:%M").to_string(),
            "isodate" => ctx.now().format("%Y-%m-%d").to_string(),
            "random" | "pick" if !args.is_empty() => self.pick(&name, &args),
            "roll" if !args.is_empty() => self.roll(args[0])?,
            _ => return None,
        };
        Some(value)
    }

    fn expand_variable(&mut self, name: &str, args: &[&str]) -> Option<String> {
        let (op, global) = match name.strip_suffix("globalvar") {
            Some(op) => (op, true),
            None => (name.strip_suffix("var")?, false),
        };
        let var_name = args.first().map(|s| s.trim())?;
        let value = args.get(1..).map(|rest| rest.join("::")).unwrap_or_default();
        let store: &mut VariableStore = if global { &mut *self.globals } else { &mut *self.locals };

        let output = match op {
            "get" => store.get(var_name, &VarAccess::default()).to_string(),
            "set" => {
                store.set(var_name, &value, &VarWrite::default());
                String::new()
            }
            "add" => {
                store.add(var_name, &value);
                String::new()
            }
            "inc" => store.increment(var_name).to_string(),
            "dec" => store.decrement(var_name).to_string(),
            _ => return None,
        };
        Some(output)
    }

    fn pick(&mut self, kind: &str, options: &[&str]) -> String {
        let occurrence = self.occurrence.to_string();
        let mut rng = seeded_rng(&[self.ctx.chat_id, kind, &occurrence, &options.join("\u{1}")]);
        options
            .choose(&mut rng)
            .map(|s| s.to_string())
            .unwrap_or_default()
    }

    fn roll(&mut self, formula: &str) -> Option<String> {
        let formula = formula.trim();
        let formula = if formula.chars().all(|c| c.is_ascii_digit()) {
            format!("1d{}", formula)
        } else {
            formula.to_string()
        };
        let caps = DICE_RE.captures(&formula)?;
        let count: u32 = caps.get(1).map(|m| m.as_str()).filter(|s| !s.is_empty()).unwrap_or("1").parse().ok()?;
        let sides: u32 = caps.get(2)?.as_str().parse().ok()?;
        if sides == 0 || count == 0 || count > 1000 {
            return None;
        }
        let modifier: i64 = match (caps.get(3), caps.get(4)) {
            (Some(sign), Some(n)) => {
                let n: i64 = n.as_str().parse().ok()?;
                if sign.as_str() == "-" { -n } else { n }
            }
            _ => 0,
        };

        let occurrence = self.occurrence.to_string();
        let mut rng = seeded_rng(&[self.ctx.chat_id, "roll", &occurrence, &formula]);
        let total: i64 = (0..count).map(|_| rng.gen_range(1..=sides) as i64).sum::<i64>() + modifier;
        Some(total.to_string())
    }
}

fn find_closing(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 1usize;
    let mut i = 0;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'{', b'{') => {
                depth += 1;
                i += 2;
            }
            (b'}', b'}') => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
                i += 2;
            }
            _ => i += 1,
        }
    }
    None
}

/// Name-only substitution used on chat history, which is not run through the
/// full macro engine.
pub fn substitute_names(text: &str, char_name: &str, user_name: &str) -> String {
    text.replace("{{char}}", char_name)
        .replace("{{user}}", user_name)
        .replace("{{persona}}", user_name)
}

/// Convenience wrapper for one-off evaluation.
pub fn evaluate_macros(
    text: &str,
    ctx: &MacroContext,
    locals: &mut VariableStore,
    globals: &mut VariableStore,
) -> String {
    MacroEngine::new(ctx, locals, globals).evaluate(text)
}
