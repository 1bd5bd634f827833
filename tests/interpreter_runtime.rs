use scriptport::interpreter::builtins::NoBindings;
use scriptport::interpreter::{HostBindings, Registry, Value};
use scriptport::runtime::executor::SERIALIZE_TIMEOUT_MESSAGE;
use scriptport::runtime::{ExecutionResult, Limits, execute, render_response};
use serde_json::{Value as Json, json};

fn reply(code: &str) -> Json {
    reply_with(code, &Limits::default())
}

fn reply_with(code: &str, limits: &Limits) -> Json {
    let result = execute(code, Some(1), limits, &NoBindings);
    let text = render_response(&result, limits);
    assert!(text.ends_with('\n'), "response must be newline terminated");
    serde_json::from_str(&text).expect("response is valid JSON")
}

fn result_of(code: &str) -> Json {
    let reply = reply(code);
    assert_eq!(reply["error"], Json::Null, "unexpected error for {code:?}: {reply}");
    assert_eq!(reply["timeout"], false);
    reply["result"].clone()
}

#[test]
fn arithmetic_and_strings() {
    assert_eq!(result_of("return 1 + 2 * 3"), json!(7));
    assert_eq!(result_of("return 7 / 2"), json!(3.5));
    assert_eq!(result_of("return 2 ^ 10"), json!(1024));
    assert_eq!(result_of("return -7 % 3"), json!(2));
    assert_eq!(result_of("return '10' + 5"), json!(15));
    assert_eq!(result_of("return 'a' .. 1 .. 'b'"), json!("a1b"));
    assert_eq!(result_of("return #'hello'"), json!(5));
    assert_eq!(result_of("return ('abc'):upper()"), json!("ABC"));
}

#[test]
fn control_flow() {
    let code = r#"
        local total = 0
        for i = 1, 10 do
            if i % 2 == 0 then
                total = total + i
            elseif i == 5 then
                break
            end
        end
        return total
    "#;
    assert_eq!(result_of(code), json!(6));

    let code = r#"
        local n, steps = 6, 0
        repeat
            n = n - 1
            steps = steps + 1
        until n == 0
        while steps < 10 do steps = steps + 2 end
        return steps
    "#;
    assert_eq!(result_of(code), json!(10));
}

#[test]
fn closures_capture_locals_by_reference() {
    let code = r#"
        local function counter()
            local n = 0
            return function() n = n + 1 return n end
        end
        local c = counter()
        c()
        c()
        return c()
    "#;
    assert_eq!(result_of(code), json!(3));
}

#[test]
fn tables_methods_and_iteration() {
    let code = r#"
        local account = {balance = 10}
        function account:deposit(amount)
            self.balance = self.balance + amount
            return self
        end
        account:deposit(5):deposit(1)
        local keys = {}
        for k, v in pairs({x = 1, y = 2}) do
            table.insert(keys, k .. '=' .. v)
        end
        return {account.balance, table.concat(keys, ',')}
    "#;
    assert_eq!(result_of(code), json!([16, "x=1,y=2"]));
}

#[test]
fn multiple_returns_expand_in_last_position() {
    let code = r#"
        local function three() return 1, 2, 3 end
        return {three(), three()}
    "#;
    assert_eq!(result_of(code), json!([1, 1, 2, 3]));
    assert_eq!(result_of("return select('#', 1, nil, 3)"), json!(3));
}

#[test]
fn unbounded_recursion_hits_call_depth_limit() {
    let reply = reply("local function f() return f() end return f()");
    assert_eq!(reply["timeout"], false);
    assert!(reply["error"].as_str().is_some_and(|e| e.contains("stack overflow")), "{reply}");
}

#[test]
fn only_first_return_value_is_reported() {
    assert_eq!(result_of("return 'first', 'second'"), json!("first"));
    assert_eq!(result_of("local x = 1"), Json::Null);
}

#[test]
fn pcall_catches_script_errors() {
    let code = r#"
        local ok, message = pcall(error, 'nope')
        return {ok, message}
    "#;
    let result = result_of(code);
    assert_eq!(result[0], json!(false));
    assert!(result[1].as_str().is_some_and(|m| m.ends_with("nope")));
}

#[test]
fn pcall_does_not_swallow_budget_exhaustion() {
    let reply = reply("pcall(function() while true do end end) return 1");
    assert_eq!(reply["timeout"], true);
    assert_eq!(reply["result"], Json::Null);
}

#[test]
fn runtime_errors_are_reported() {
    let reply = reply("local t = nil\nreturn t.x");
    assert_eq!(reply["timeout"], false);
    assert_eq!(reply["result"], Json::Null);
    let error = reply["error"].as_str().expect("error text");
    assert!(error.starts_with("line 2:"), "{error}");

    let reply = reply_with("error('custom failure')", &Limits::default());
    assert!(reply["error"].as_str().is_some_and(|e| e.contains("custom failure")));
}

#[test]
fn syntax_errors_cost_no_steps() {
    let limits = Limits::default().with_compute_budget(1);
    let reply = reply_with("return )", &limits);
    assert_eq!(reply["timeout"], false);
    assert!(reply["error"].as_str().is_some_and(|e| e.starts_with("syntax error")));
}

#[test]
fn compute_budget_bounds_every_loop() {
    for code in [
        "while true do end",
        "repeat until false",
        "for i = 1, 1e9 do end",
        "local t = {} for i = 1, 1e9 do t[i] = i end",
    ] {
        let reply = reply(code);
        assert_eq!(reply["timeout"], true, "{code}");
        assert_eq!(reply["error"], Json::Null, "{code}");
        assert_eq!(reply["reply_id"], 1);
    }
}

#[test]
fn string_growth_is_refused_before_it_exhausts_memory() {
    for code in [
        "local s = 'x' for i = 1, 40 do s = s .. s end return #s",
        "return #string.rep('', 1e12)",
        "return #string.rep('ab', 1e12)",
    ] {
        let reply = reply(code);
        assert_eq!(reply["timeout"], false, "{code}");
        if code.contains("''") {
            assert_eq!(reply["result"], json!(0), "{code}");
        } else {
            assert!(
                reply["error"].as_str().is_some_and(|e| e.contains("too large")),
                "{code}: {reply}"
            );
        }
    }
}

#[test]
fn budget_is_per_request() {
    let limits = Limits::default().with_compute_budget(100);
    let busy = "local n = 0 for i = 1, 5 do n = n + i end return n";
    for _ in 0..3 {
        assert_eq!(reply_with(busy, &limits)["result"], json!(15));
    }
}

#[test]
fn globals_do_not_leak_between_requests() {
    assert_eq!(result_of("counter = 41 return counter + 1"), json!(42));
    assert_eq!(result_of("return counter"), Json::Null);
}

#[test]
fn self_reference_renders_recursion_marker() {
    let result = result_of("local t = {name = 'loop'} t.self = t return t");
    assert_eq!(result, json!({"name": "loop", "self": "<recursion>"}));
}

#[test]
fn shared_subtables_are_not_cycles() {
    let result = result_of("local leaf = {1} return {a = leaf, b = leaf}");
    assert_eq!(result, json!({"a": [1], "b": [1]}));
}

#[test]
fn nesting_past_depth_cap_renders_too_deep() {
    assert_eq!(result_of("return {{{{1}}}}"), json!([[[[1]]]]));
    assert_eq!(result_of("return {{{{{1}}}}}"), json!([[[["<too deep>"]]]]));

    let shallow = Limits::default().with_depth_cap(1);
    let reply = reply_with("return {a = {b = 1}}", &shallow);
    assert_eq!(reply["result"], json!({"a": "<too deep>"}));
}

#[test]
fn sparse_tables_follow_density_rule() {
    assert_eq!(result_of("return {[1]=1, [2]=2, [3]=3}"), json!([1, 2, 3]));
    assert_eq!(
        result_of("return {[1]=1, [2]=2, [3]=3, [5]=5}"),
        json!({"1": 1, "2": 2, "3": 3, "5": 5})
    );

    let one_hole = "local t = {} for i = 1, 10 do t[i] = i end t[5] = nil return t";
    assert_eq!(
        result_of(one_hole),
        json!([1, 2, 3, 4, null, 6, 7, 8, 9, 10])
    );

    let two_holes = "local t = {} for i = 1, 10 do t[i] = i end t[4] = nil t[5] = nil return t";
    let result = result_of(two_holes);
    assert!(result.is_object(), "{result}");
    assert_eq!(result.as_object().map(|o| o.len()), Some(8));
}

#[test]
fn mixed_keys_render_as_objects_in_insertion_order() {
    let reply = execute("return {z = 1, 10, a = 2}", Some(1), &Limits::default(), &NoBindings);
    let text = render_response(&reply, &Limits::default());
    let z = text.find("\"z\"").expect("z key");
    let one = text.find("\"1\"").expect("1 key");
    let a = text.find("\"a\"").expect("a key");
    assert!(z < one && one < a, "{text}");
}

#[test]
fn non_json_scalars_render_as_strings() {
    assert_eq!(result_of("return math.huge"), json!("inf"));
    assert_eq!(result_of("return {}"), json!([]));
    let closure = result_of("return function() end");
    assert!(closure.as_str().is_some_and(|f| f.starts_with("function: ")));
    assert_eq!(result_of("return print"), json!("builtin: print"));
}

#[test]
fn serialize_budget_is_separate_from_compute_budget() {
    let limits = Limits::default().with_serialize_budget(30);
    let reply = reply_with("local t = {} for i = 1, 50 do t[i] = i end return t", &limits);
    assert_eq!(reply["timeout"], true);
    assert_eq!(reply["result"], Json::Null);
    assert_eq!(reply["error"], SERIALIZE_TIMEOUT_MESSAGE);
    assert_eq!(reply["reply_id"], 1);
}

#[test]
fn error_envelope_without_request_id() {
    let result = ExecutionResult::failed(None, "protocol error: empty request");
    let parsed: Json =
        serde_json::from_str(&render_response(&result, &Limits::default())).expect("json");
    assert_eq!(parsed["reply_id"], Json::Null);
    assert_eq!(parsed["error"], "protocol error: empty request");
}

struct Greeter;

impl HostBindings for Greeter {
    fn install(&self, registry: &mut Registry<'_>) {
        registry.value("host.greeting", "hello");
        registry.function("host.shout", |_, args| {
            let text = args.first().map(Value::to_string).unwrap_or_default();
            Ok(vec![Value::from(text.to_uppercase())])
        });
    }
}

#[test]
fn host_bindings_are_installed_as_namespaces() {
    let result = execute(
        "return host.shout(host.greeting .. ' world')",
        Some(3),
        &Limits::default(),
        &Greeter,
    );
    assert_eq!(result.value, Value::from("HELLO WORLD"));
    assert_eq!(result.request_id, Some(3));
}

#[test]
fn capability_surface_excludes_host_access() {
    for name in ["io", "os", "require", "load", "dofile", "debug"] {
        assert_eq!(result_of(&format!("return type({name})")), json!("nil"), "{name}");
    }
}
