//! Methods on string, number, and bool values.

use std::cmp::Ordering;

use crate::lang::natives::{CallArgs, NativeRegistry, NativeResult};
use crate::lang::object::{Obj, ObjType};
use crate::lang::types::tag;
use crate::workspace::Workspace;

pub fn register(reg: &mut NativeRegistry) {
    let s = ObjType::Str;
    reg.add_method(s, "format", format_fn);
    reg.add_method(s, "join", join);
    reg.add_method(s, "split", split);
    reg.add_method(s, "strip", strip);
    reg.add_method(s, "to_upper", to_upper);
    reg.add_method(s, "to_lower", to_lower);
    reg.add_method(s, "underscorify", underscorify);
    reg.add_method(s, "startswith", startswith);
    reg.add_method(s, "endswith", endswith);
    reg.add_method(s, "contains", contains);
    reg.add_method(s, "substring", substring);
    reg.add_method(s, "replace", replace);
    reg.add_method(s, "to_int", to_int);
    reg.add_method(s, "version_compare", version_compare);

    let n = ObjType::Number;
    reg.add_method(n, "to_string", number_to_string);
    reg.add_method(n, "is_even", is_even);
    reg.add_method(n, "is_odd", is_odd);

    let b = ObjType::Bool;
    reg.add_method(b, "to_string", bool_to_string);
    reg.add_method(b, "to_int", bool_to_int);
}

/// `'@0@ @1@'.format(a, b)`: positional placeholder substitution.
fn format_fn(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let template = wk.heap.str_display(this);
    let values = args.rest(wk, "value", tag::ANY)?;
    let mut out = String::new();
    let mut rest = template.as_str();
    while let Some(start) = rest.find('@') {
        let after = &rest[start + 1..];
        if let Some(end) = after.find('@')
            && let Ok(index) = after[..end].parse::<usize>()
        {
            let Some(value) = values.get(index) else {
                wk.vm_error(&format!("format placeholder @{index}@ out of range"));
                return Err(());
            };
            out.push_str(&rest[..start]);
            out.push_str(&wk.heap.obj_display(*value));
            rest = &after[end + 1..];
            continue;
        }
        out.push_str(&rest[..=start]);
        rest = after;
    }
    out.push_str(rest);
    Ok(wk.stri(&out))
}

fn join(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let list = args.next_pos(wk, "list", tag::STR.listify())?;
    let sep = wk.heap.str_display(this);
    let parts: Vec<String> =
        wk.heap.arr_to_vec(list).iter().map(|o| wk.heap.str_display(*o)).collect();
    Ok(wk.stri(&parts.join(&sep)))
}

fn split(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let sep = args.opt_pos(wk, "separator", tag::STR)?;
    let text = wk.heap.str_display(this);
    let parts: Vec<String> = match sep {
        Some(sep) => {
            let sep = wk.heap.str_display(sep);
            text.split(sep.as_str()).map(ToOwned::to_owned).collect()
        }
        None => text.split_whitespace().map(ToOwned::to_owned).collect(),
    };
    let objs: Vec<Obj> = parts.iter().map(|p| wk.heap.str_intern(p.as_bytes())).collect();
    Ok(wk.heap.arr_from_vec(&objs))
}

fn strip(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let chars = args.opt_pos(wk, "strip characters", tag::STR)?;
    let text = wk.heap.str_display(this);
    let stripped = match chars {
        Some(chars) => {
            let set: Vec<char> = wk.heap.str_display(chars).chars().collect();
            text.trim_matches(|c| set.contains(&c)).to_owned()
        }
        None => text.trim().to_owned(),
    };
    Ok(wk.stri(&stripped))
}

fn to_upper(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let text = wk.heap.str_display(this).to_uppercase();
    Ok(wk.stri(&text))
}

fn to_lower(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let text = wk.heap.str_display(this).to_lowercase();
    Ok(wk.stri(&text))
}

/// Non-alphanumerics become underscores; handy for macro names.
fn underscorify(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let text: String = wk
        .heap
        .str_display(this)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    Ok(wk.stri(&text))
}

fn startswith(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let prefix = args.next_pos(wk, "prefix", tag::STR)?;
    let result = wk.heap.str_bytes(this).starts_with(wk.heap.str_bytes(prefix));
    Ok(wk.heap.make_bool(result))
}

fn endswith(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let suffix = args.next_pos(wk, "suffix", tag::STR)?;
    let result = wk.heap.str_bytes(this).ends_with(wk.heap.str_bytes(suffix));
    Ok(wk.heap.make_bool(result))
}

fn contains(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let needle = args.next_pos(wk, "needle", tag::STR)?;
    let hay = wk.heap.str_display(this);
    let needle = wk.heap.str_display(needle);
    Ok(wk.heap.make_bool(hay.contains(&needle)))
}

fn substring(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let text = wk.heap.str_display(this);
    let len = i64::try_from(text.len()).unwrap_or(i64::MAX);
    let clamp = |v: i64| -> usize {
        let v = if v < 0 { len + v } else { v };
        usize::try_from(v.clamp(0, len)).unwrap_or(0)
    };
    let start = args.opt_pos(wk, "start", tag::NUMBER)?.and_then(|v| wk.heap.number(v)).unwrap_or(0);
    let end = args.opt_pos(wk, "end", tag::NUMBER)?.and_then(|v| wk.heap.number(v)).unwrap_or(len);
    let (start, end) = (clamp(start), clamp(end));
    let slice = text.get(start..end.max(start)).unwrap_or("");
    Ok(wk.stri(slice))
}

fn replace(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let from = args.next_pos(wk, "old", tag::STR)?;
    let to = args.next_pos(wk, "new", tag::STR)?;
    let text = wk.heap.str_display(this);
    let from = wk.heap.str_display(from);
    let to = wk.heap.str_display(to);
    let replaced = text.replace(&from, &to);
    Ok(wk.stri(&replaced))
}

fn to_int(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let text = wk.heap.str_display(this);
    match text.trim().parse::<i64>() {
        Ok(n) => Ok(wk.heap.make_number(n)),
        Err(_) => {
            wk.vm_error(&format!("'{text}' is not an integer"));
            Err(())
        }
    }
}

/// Compare dotted versions segment by segment; missing segments are zero.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|seg| {
                seg.chars().take_while(char::is_ascii_digit).collect::<String>().parse().unwrap_or(0)
            })
            .collect()
    };
    let (va, vb) = (parse(a), parse(b));
    for i in 0..va.len().max(vb.len()) {
        let x = va.get(i).copied().unwrap_or(0);
        let y = vb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

fn version_compare(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let req = args.next_pos(wk, "comparison", tag::STR)?;
    let version = wk.heap.str_display(this);
    let req = wk.heap.str_display(req);
    let (op, rhs) = [">=", "<=", "==", "!=", ">", "<", "="]
        .iter()
        .find_map(|op| req.strip_prefix(*op).map(|rest| (*op, rest.trim())))
        .unwrap_or(("==", req.trim()));
    let ord = compare_versions(&version, rhs);
    let result = match op {
        ">=" => ord != Ordering::Less,
        "<=" => ord != Ordering::Greater,
        "!=" => ord != Ordering::Equal,
        ">" => ord == Ordering::Greater,
        "<" => ord == Ordering::Less,
        _ => ord == Ordering::Equal,
    };
    Ok(wk.heap.make_bool(result))
}

fn number_to_string(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let text = wk.heap.obj_display(this);
    Ok(wk.stri(&text))
}

fn is_even(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let n = wk.heap.number(this).unwrap_or(0);
    Ok(wk.heap.make_bool(n % 2 == 0))
}

fn is_odd(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let n = wk.heap.number(this).unwrap_or(0);
    Ok(wk.heap.make_bool(n % 2 != 0))
}

fn bool_to_string(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let true_str = args.opt_pos(wk, "true text", tag::STR)?;
    let false_str = args.opt_pos(wk, "false text", tag::STR)?;
    let value = this == Obj::TRUE;
    match (value, true_str, false_str) {
        (true, Some(t), _) => Ok(t),
        (false, _, Some(f)) => Ok(f),
        (b, _, _) => Ok(wk.stri(if b { "true" } else { "false" })),
    }
}

fn bool_to_int(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    Ok(wk.heap.make_number(i64::from(this == Obj::TRUE)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1.2.3", "1.2.3", Ordering::Equal)]
    #[case("1.10", "1.9", Ordering::Greater)]
    #[case("1.2", "1.2.1", Ordering::Less)]
    #[case("2", "1.9.9", Ordering::Greater)]
    fn version_ordering(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        assert_eq!(compare_versions(a, b), expected);
    }

    #[rstest]
    fn string_methods_through_the_vm() {
        let mut wk = Workspace::bare();
        wk.eval_snippet(
            "a = 'a-b-c'.split('-')\nb = ' x '.strip()\nc = '@0@!'.format(7)\nd = '1.2.0'.version_compare('>=1.1')",
        )
        .expect("eval");
        let a = wk.scope_lookup_bytes(b"a").expect("a");
        assert_eq!(wk.heap.arr_len(a), 3);
        let b = wk.scope_lookup_bytes(b"b").expect("b");
        assert_eq!(wk.heap.str_bytes(b), b"x");
        let c = wk.scope_lookup_bytes(b"c").expect("c");
        assert_eq!(wk.heap.str_bytes(c), b"7!");
        let d = wk.scope_lookup_bytes(b"d").expect("d");
        assert_eq!(d, Obj::TRUE);
    }
}
