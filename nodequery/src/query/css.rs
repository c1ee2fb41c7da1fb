//! CSS selector to XPath translation
//!
//! Selectors are scanned with anchored regexes, one compound selector at a
//! time. Each selector group becomes one relative location path; groups are
//! joined with `|`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

static TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:((?:\*|[\w-]+)?)\|)?(\*|[\w-]+)").unwrap());
static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#([\w-]+)").unwrap());
static CLASS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\.([\w-]+)").unwrap());
static ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^\[\s*(?:((?:\*|[\w-]+)?)\|)?([\w-]+)\s*(?:([~|^$*!]?=)\s*(?:"([^"]*)"|'([^']*)'|([^\]\s"']+))\s*)?\]"#,
    )
    .unwrap()
});
static PSEUDO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^:([\w-]+)").unwrap());
static COMBINATOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*([>+~,])\s*").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s+").unwrap());
static NTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:([+-]?\d*)n\s*(?:([+-])\s*(\d+))?|([+-]?\d+))$").unwrap());

const SIBLING_POSITION: &str = "(count(preceding-sibling::*) + 1)";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Combinator {
    Descendant,
    Child,
    Adjacent,
    Sibling,
}

/// One compound selector: an element test plus predicates
#[derive(Debug)]
struct Compound {
    /// XPath node test, e.g. `div`, `p:item`, `*`
    test: String,
    /// Whether the test names an element (needed by `*-of-type`)
    named: bool,
    predicates: Vec<String>,
}

impl Compound {
    fn predicates(&self) -> String {
        self.predicates
            .iter()
            .map(|p| format!("[{}]", p))
            .collect::<String>()
    }
}

fn invalid(selector: &str, message: impl std::fmt::Display) -> Error {
    Error::QueryExpression(format!("invalid CSS selector `{}`: {}", selector, message))
}

/// Translate a CSS selector into an equivalent relative XPath expression
///
/// The translation is deterministic: the same selector always yields the
/// same expression.
pub fn css_to_xpath(selector: &str) -> Result<String> {
    let mut groups = Vec::new();
    let mut rest = selector.trim();
    if rest.is_empty() {
        return Err(invalid(selector, "empty selector"));
    }

    let mut path = String::new();
    let mut combinator = Combinator::Descendant;
    let mut first = true;

    // A group may start with a combinator, relative to the context node
    if let Some(caps) = COMBINATOR_RE.captures(rest) {
        combinator = leading_combinator(selector, &caps[1])?;
        rest = &rest[caps[0].len()..];
    }

    loop {
        let (compound, remaining) = parse_compound(selector, rest)?;
        path.push_str(&step(combinator, first, &compound));
        first = false;
        rest = remaining;

        if rest.is_empty() {
            groups.push(path);
            break;
        }
        if let Some(caps) = COMBINATOR_RE.captures(rest) {
            rest = &rest[caps[0].len()..];
            combinator = match &caps[1] {
                ">" => Combinator::Child,
                "+" => Combinator::Adjacent,
                "~" => Combinator::Sibling,
                _ => {
                    // ","
                    groups.push(std::mem::take(&mut path));
                    first = true;
                    let mut next = Combinator::Descendant;
                    if let Some(caps) = COMBINATOR_RE.captures(rest) {
                        next = leading_combinator(selector, &caps[1])?;
                        rest = &rest[caps[0].len()..];
                    }
                    next
                }
            };
            if rest.is_empty() {
                return Err(invalid(selector, "dangling combinator"));
            }
        } else if let Some(m) = WHITESPACE_RE.find(rest) {
            rest = &rest[m.end()..];
            combinator = Combinator::Descendant;
        } else {
            return Err(invalid(selector, format!("unexpected `{}`", rest)));
        }
    }

    Ok(groups.join(" | "))
}

fn leading_combinator(selector: &str, token: &str) -> Result<Combinator> {
    match token {
        ">" => Ok(Combinator::Child),
        "+" => Ok(Combinator::Adjacent),
        "~" => Ok(Combinator::Sibling),
        _ => Err(invalid(selector, "empty selector group")),
    }
}

fn step(combinator: Combinator, first: bool, compound: &Compound) -> String {
    let predicates = compound.predicates();
    let axis_prefix = match (combinator, first) {
        (Combinator::Descendant, true) => ".//",
        (Combinator::Descendant, false) => "//",
        (_, true) => "./",
        (_, false) => "/",
    };
    match combinator {
        Combinator::Descendant | Combinator::Child => {
            format!("{}{}{}", axis_prefix, compound.test, predicates)
        }
        Combinator::Adjacent => {
            let self_test = if compound.test == "*" {
                String::new()
            } else {
                format!("[self::{}]", compound.test)
            };
            format!("{}following-sibling::*[1]{}{}", axis_prefix, self_test, predicates)
        }
        Combinator::Sibling => {
            format!("{}following-sibling::{}{}", axis_prefix, compound.test, predicates)
        }
    }
}

fn parse_compound<'s>(selector: &str, input: &'s str) -> Result<(Compound, &'s str)> {
    let mut rest = input;
    let mut compound = Compound {
        test: "*".to_string(),
        named: false,
        predicates: Vec::new(),
    };

    if let Some(caps) = TYPE_RE.captures(rest) {
        let name = &caps[2];
        let namespace = caps.get(1).map(|m| m.as_str());
        compound.named = name != "*";
        compound.test = element_test(namespace, name);
        rest = &rest[caps[0].len()..];
    }

    loop {
        if let Some(caps) = ID_RE.captures(rest) {
            compound.predicates.push(format!("@id = {}", xpath_literal(&caps[1])));
            rest = &rest[caps[0].len()..];
        } else if let Some(caps) = CLASS_RE.captures(rest) {
            compound.predicates.push(word_match("@class", &caps[1]));
            rest = &rest[caps[0].len()..];
        } else if let Some(caps) = ATTRIBUTE_RE.captures(rest) {
            let attribute = attribute_test(caps.get(1).map(|m| m.as_str()), &caps[2]);
            let value = caps
                .get(4)
                .or_else(|| caps.get(5))
                .or_else(|| caps.get(6))
                .map(|m| m.as_str());
            let predicate = match (caps.get(3).map(|m| m.as_str()), value) {
                (None, _) => attribute,
                (Some(op), Some(value)) => attribute_predicate(selector, &attribute, op, value)?,
                (Some(_), None) => return Err(invalid(selector, "attribute operator without value")),
            };
            compound.predicates.push(predicate);
            rest = &rest[caps[0].len()..];
        } else if let Some(caps) = PSEUDO_RE.captures(rest) {
            let name_len = caps[0].len();
            let argument = parenthesized(selector, &rest[name_len..])?;
            let predicate = pseudo_predicate(selector, &compound, &caps[1], argument.map(|(arg, _)| arg))?;
            compound.predicates.push(predicate);
            rest = &rest[name_len + argument.map_or(0, |(_, len)| len)..];
        } else {
            break;
        }
    }

    if rest.len() == input.len() {
        let shown = if input.is_empty() { "end of selector" } else { input };
        return Err(invalid(selector, format!("expected a selector at `{}`", shown)));
    }
    Ok((compound, rest))
}

/// Argument of a functional pseudo-class, matched up to its balanced closing
/// parenthesis. Returns the trimmed argument and the length consumed.
fn parenthesized<'a>(selector: &str, input: &'a str) -> Result<Option<(&'a str, usize)>> {
    if !input.starts_with('(') {
        return Ok(None);
    }
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in input.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some((input[1..i].trim(), i + 1)));
                }
            }
            _ => {}
        }
    }
    Err(invalid(selector, "unbalanced parentheses"))
}

fn element_test(namespace: Option<&str>, name: &str) -> String {
    match (namespace, name) {
        (None, name) => name.to_string(),
        (Some("*"), "*") => "*".to_string(),
        (Some("*"), name) => format!("*[local-name() = {}]", xpath_literal(name)),
        (Some(""), "*") => "*[namespace-uri() = '']".to_string(),
        (Some(""), name) => format!(
            "*[namespace-uri() = '' and local-name() = {}]",
            xpath_literal(name)
        ),
        (Some(prefix), name) => format!("{}:{}", prefix, name),
    }
}

fn attribute_test(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        None | Some("") => format!("@{}", name),
        Some("*") => format!("@*[local-name() = {}]", xpath_literal(name)),
        Some(prefix) => format!("@{}:{}", prefix, name),
    }
}

fn word_match(attribute: &str, word: &str) -> String {
    format!(
        "contains(concat(' ', normalize-space({}), ' '), {})",
        attribute,
        xpath_literal(&format!(" {} ", word))
    )
}

fn attribute_predicate(selector: &str, attribute: &str, op: &str, value: &str) -> Result<String> {
    let literal = xpath_literal(value);
    Ok(match op {
        "=" => format!("{} = {}", attribute, literal),
        "!=" => format!("not({} = {})", attribute, literal),
        "~=" => word_match(attribute, value),
        "|=" => format!(
            "{} = {} or starts-with({}, {})",
            attribute,
            literal,
            attribute,
            xpath_literal(&format!("{}-", value))
        ),
        "^=" => format!("starts-with({}, {})", attribute, literal),
        "$=" => format!(
            "substring({}, string-length({}) - {} + 1) = {}",
            attribute,
            attribute,
            value.chars().count(),
            literal
        ),
        "*=" => format!("contains({}, {})", attribute, literal),
        other => return Err(invalid(selector, format!("unknown attribute operator `{}`", other))),
    })
}

fn pseudo_predicate(selector: &str, compound: &Compound, name: &str, argument: Option<&str>) -> Result<String> {
    let of_type = |axis: &str| -> Result<String> {
        if !compound.named {
            return Err(invalid(selector, format!(":{} needs an element name", name)));
        }
        Ok(format!("not({}::{})", axis, compound.test))
    };

    match (name, argument) {
        ("first-child", None) => Ok("not(preceding-sibling::*)".to_string()),
        ("last-child", None) => Ok("not(following-sibling::*)".to_string()),
        ("only-child", None) => Ok("not(preceding-sibling::*) and not(following-sibling::*)".to_string()),
        ("first-of-type", None) => of_type("preceding-sibling"),
        ("last-of-type", None) => of_type("following-sibling"),
        ("empty", None) => Ok("not(*) and not(text())".to_string()),
        ("root", None) => Ok("not(parent::*)".to_string()),
        ("nth-child", Some(argument)) => nth_child(selector, argument),
        ("not", Some(argument)) => {
            let (inner, rest) = parse_compound(selector, argument)?;
            if !rest.trim().is_empty() {
                return Err(invalid(selector, ":not() takes a single compound selector"));
            }
            Ok(format!("not(self::{}{})", inner.test, inner.predicates()))
        }
        (name, _) => Err(invalid(selector, format!("unsupported pseudo-class `:{}`", name))),
    }
}

/// `:nth-child(an+b)` as a predicate over the element's sibling position
fn nth_child(selector: &str, argument: &str) -> Result<String> {
    let normalized = match argument.trim() {
        "odd" => "2n+1".to_string(),
        "even" => "2n".to_string(),
        other => other.replace(' ', ""),
    };
    let caps = NTH_RE
        .captures(&normalized)
        .ok_or_else(|| invalid(selector, format!("bad :nth-child argument `{}`", argument)))?;

    let bad = |_| invalid(selector, format!("bad :nth-child argument `{}`", argument));
    if let Some(b) = caps.get(4) {
        let b: i64 = b.as_str().parse().map_err(bad)?;
        return Ok(format!("{} = {}", SIBLING_POSITION, b));
    }

    let a: i64 = match caps.get(1).map(|m| m.as_str()).unwrap_or("") {
        "" | "+" => 1,
        "-" => -1,
        digits => digits.parse().map_err(bad)?,
    };
    let b: i64 = match (caps.get(2), caps.get(3)) {
        (Some(sign), Some(digits)) => {
            let value: i64 = digits.as_str().parse().map_err(bad)?;
            if sign.as_str() == "-" {
                -value
            } else {
                value
            }
        }
        _ => 0,
    };

    Ok(match a {
        0 => format!("{} = {}", SIBLING_POSITION, b),
        a if a > 0 => format!(
            "{pos} >= {b} and ({pos} - {b}) mod {a} = 0",
            pos = SIBLING_POSITION,
            a = a,
            b = b
        ),
        a => format!(
            "{pos} <= {b} and ({b} - {pos}) mod {a} = 0",
            pos = SIBLING_POSITION,
            a = -a,
            b = b
        ),
    })
}

/// Quote a string as an XPath literal, falling back to `concat()` when it
/// holds both quote kinds
pub(crate) fn xpath_literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{}'", value)
    } else if !value.contains('"') {
        format!("\"{}\"", value)
    } else {
        let parts: Vec<String> = value
            .split('\'')
            .map(|part| format!("'{}'", part))
            .collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_and_combinators() {
        assert_eq!(css_to_xpath("a").unwrap(), ".//a");
        assert_eq!(css_to_xpath("a b").unwrap(), ".//a//b");
        assert_eq!(css_to_xpath("a > b").unwrap(), ".//a/b");
        assert_eq!(css_to_xpath("a>b").unwrap(), ".//a/b");
        assert_eq!(css_to_xpath("a + b").unwrap(), ".//a/following-sibling::*[1][self::b]");
        assert_eq!(css_to_xpath("a ~ b").unwrap(), ".//a/following-sibling::b");
        assert_eq!(css_to_xpath("> b").unwrap(), "./b");
    }

    #[test]
    fn test_groups() {
        assert_eq!(css_to_xpath("a, b > c").unwrap(), ".//a | .//b/c");
    }

    #[test]
    fn test_id_and_class() {
        assert_eq!(css_to_xpath("#main").unwrap(), ".//*[@id = 'main']");
        assert_eq!(
            css_to_xpath("li.item").unwrap(),
            ".//li[contains(concat(' ', normalize-space(@class), ' '), ' item ')]"
        );
    }

    #[test]
    fn test_attribute_operators() {
        assert_eq!(css_to_xpath("[href]").unwrap(), ".//*[@href]");
        assert_eq!(css_to_xpath("a[rel=\"next\"]").unwrap(), ".//a[@rel = 'next']");
        assert_eq!(css_to_xpath("a[rel!=next]").unwrap(), ".//a[not(@rel = 'next')]");
        assert_eq!(css_to_xpath("a[href^='http']").unwrap(), ".//a[starts-with(@href, 'http')]");
        assert_eq!(
            css_to_xpath("a[href$='.pdf']").unwrap(),
            ".//a[substring(@href, string-length(@href) - 4 + 1) = '.pdf']"
        );
        assert_eq!(css_to_xpath("a[href*=x]").unwrap(), ".//a[contains(@href, 'x')]");
        assert_eq!(
            css_to_xpath("[lang|=en]").unwrap(),
            ".//*[@lang = 'en' or starts-with(@lang, 'en-')]"
        );
    }

    #[test]
    fn test_namespaced_names() {
        assert_eq!(css_to_xpath("svg|rect").unwrap(), ".//svg:rect");
        assert_eq!(css_to_xpath("*|rect").unwrap(), ".//*[local-name() = 'rect']");
        assert_eq!(css_to_xpath("[xl|href]").unwrap(), ".//*[@xl:href]");
    }

    #[test]
    fn test_pseudo_classes() {
        assert_eq!(css_to_xpath("li:first-child").unwrap(), ".//li[not(preceding-sibling::*)]");
        assert_eq!(css_to_xpath("li:last-of-type").unwrap(), ".//li[not(following-sibling::li)]");
        assert_eq!(css_to_xpath(":root").unwrap(), ".//*[not(parent::*)]");
        assert_eq!(
            css_to_xpath("li:nth-child(3)").unwrap(),
            ".//li[(count(preceding-sibling::*) + 1) = 3]"
        );
        assert_eq!(
            css_to_xpath("li:nth-child(odd)").unwrap(),
            ".//li[(count(preceding-sibling::*) + 1) >= 1 and ((count(preceding-sibling::*) + 1) - 1) mod 2 = 0]"
        );
        assert_eq!(
            css_to_xpath("li:nth-child(-n+2)").unwrap(),
            ".//li[(count(preceding-sibling::*) + 1) <= 2 and (2 - (count(preceding-sibling::*) + 1)) mod 1 = 0]"
        );
        assert_eq!(css_to_xpath("li:not(.x)").unwrap(),
            ".//li[not(self::*[contains(concat(' ', normalize-space(@class), ' '), ' x ')])]");
        assert_eq!(
            css_to_xpath("li:not(:nth-child(2))").unwrap(),
            ".//li[not(self::*[(count(preceding-sibling::*) + 1) = 2])]"
        );
        assert_eq!(css_to_xpath("a:not([title='(x)'])").unwrap(), ".//a[not(self::*[@title = '(x)'])]");
    }

    #[test]
    fn test_translation_is_deterministic() {
        let selector = "ul > li.a:not([hidden]) + li, p ~ span";
        assert_eq!(css_to_xpath(selector).unwrap(), css_to_xpath(selector).unwrap());
    }

    #[test]
    fn test_invalid_selectors() {
        for selector in ["", "a:hover", "a[", "a >", "a,,b", "*:first-of-type", "li:nth-child(x)", "li:not(.x"] {
            let err = css_to_xpath(selector).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::QueryExpression, "{}", selector);
        }
    }

    #[test]
    fn test_xpath_literal_quoting() {
        assert_eq!(xpath_literal("plain"), "'plain'");
        assert_eq!(xpath_literal("it's"), "\"it's\"");
        assert_eq!(xpath_literal("a'b\"c"), "concat('a', \"'\", 'b\"c')");
    }
}
