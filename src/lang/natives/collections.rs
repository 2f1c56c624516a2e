//! Methods on arrays and dicts.

use crate::lang::natives::{CallArgs, NativeRegistry, NativeResult};
use crate::lang::object::{DictKey, Obj, ObjType};
use crate::lang::types::tag;
use crate::workspace::Workspace;

pub fn register(reg: &mut NativeRegistry) {
    let a = ObjType::Array;
    reg.add_method(a, "length", arr_length);
    reg.add_method(a, "contains", arr_contains);
    reg.add_method(a, "get", arr_get);
    reg.add_method(a, "flatten", arr_flatten);

    let d = ObjType::Dict;
    reg.add_method(d, "has_key", dict_has_key);
    reg.add_method(d, "keys", dict_keys);
    reg.add_method(d, "get", dict_get);
}

fn arr_length(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let len = i64::try_from(wk.heap.arr_len(this)).unwrap_or(i64::MAX);
    Ok(wk.heap.make_number(len))
}

/// Deep containment: descends into nested arrays like the `in` operator
/// does not.
fn arr_contains(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let needle = args.next_pos(wk, "needle", tag::ANY)?;
    fn search(wk: &Workspace, arr: Obj, needle: Obj) -> bool {
        wk.heap.arr_iter(arr).any(|v| {
            wk.heap.obj_equal(v, needle)
                || (wk.heap.typ(v) == ObjType::Array && search(wk, v, needle))
        })
    }
    let found = search(wk, this, needle);
    Ok(wk.heap.make_bool(found))
}

fn arr_get(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let index = args.next_pos(wk, "index", tag::NUMBER)?;
    let fallback = args.opt_pos(wk, "fallback", tag::ANY)?;
    let i = wk.heap.number(index).unwrap_or(0);
    let len = i64::try_from(wk.heap.arr_len(this)).unwrap_or(0);
    let resolved = if i < 0 { i + len } else { i };
    let value =
        usize::try_from(resolved).ok().and_then(|idx| wk.heap.arr_get(this, idx)).or(fallback);
    match value {
        Some(v) => Ok(v),
        None => {
            wk.vm_error(&format!("index {i} out of bounds for array of length {len}"));
            Err(())
        }
    }
}

fn arr_flatten(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    fn flatten_into(wk: &mut Workspace, out: Obj, arr: Obj) {
        for item in wk.heap.arr_to_vec(arr) {
            if wk.heap.typ(item) == ObjType::Array {
                flatten_into(wk, out, item);
            } else {
                wk.heap.arr_push(out, item);
            }
        }
    }
    let out = wk.heap.arr_new();
    flatten_into(wk, out, this);
    Ok(out)
}

fn dict_has_key(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let key = args.next_pos(wk, "key", tag::STR)?;
    let found = wk.heap.dict_get_str(this, key).is_some();
    Ok(wk.heap.make_bool(found))
}

fn dict_keys(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let keys: Vec<Obj> = wk
        .heap
        .dict_iter(this)
        .map(|(k, _)| match k {
            DictKey::Str(s) => Ok(s),
            DictKey::Int(n) => Err(n),
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|k| match k {
            Ok(s) => s,
            Err(n) => wk.heap.make_number(n),
        })
        .collect();
    Ok(wk.heap.arr_from_vec(&keys))
}

fn dict_get(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let key = args.next_pos(wk, "key", tag::STR)?;
    let fallback = args.opt_pos(wk, "fallback", tag::ANY)?;
    match wk.heap.dict_get_str(this, key).or(fallback) {
        Some(value) => Ok(value),
        None => {
            let k = wk.heap.str_display(key);
            wk.vm_error(&format!("key '{k}' not found"));
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_methods_through_the_vm() {
        let mut wk = Workspace::bare();
        wk.eval_snippet(
            "a = [1, [2, 3]].flatten()\nn = a.length()\nc = [1, [2]].contains(2)\nk = {'x': 1}.keys()\ng = {'x': 1}.get('y', 9)",
        )
        .expect("eval");
        let a = wk.scope_lookup_bytes(b"a").expect("a");
        assert_eq!(wk.heap.arr_len(a), 3);
        let n = wk.scope_lookup_bytes(b"n").expect("n");
        assert_eq!(wk.heap.number(n), Some(3));
        assert_eq!(wk.scope_lookup_bytes(b"c"), Some(Obj::TRUE));
        let k = wk.scope_lookup_bytes(b"k").expect("k");
        assert_eq!(wk.heap.arr_len(k), 1);
        let g = wk.scope_lookup_bytes(b"g").expect("g");
        assert_eq!(wk.heap.number(g), Some(9));
    }
}
