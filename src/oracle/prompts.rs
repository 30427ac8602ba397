//! Chat messages for each oracle call.
//!
//! Each builder returns the full conversation for one call. The user's
//! request always arrives as `I want a: ...`, followed by whatever context
//! the call needs.

use crate::llm::ChatMessage;
use crate::template::PackageManager;

/// Shared system preamble.
pub const SYSTEM_PREAMBLE: &str = "You are a top tier AI developer who is trying to write a program that will generate code for the user based on their intent.
Do not leave any todos, fully implement every feature requested.";

fn system(body: &str) -> ChatMessage {
    ChatMessage::system(format!("{}\n\n{}", SYSTEM_PREAMBLE, body))
}

fn want(prompt: &str) -> ChatMessage {
    ChatMessage::user(format!("I want a: {}", prompt))
}

fn agreed_plan(plan: &str) -> ChatMessage {
    ChatMessage::user(format!("The plan we have agreed on is: {}", plan))
}

fn file_list(file_paths: &[String]) -> ChatMessage {
    ChatMessage::user(format!("The full list of file paths is {:?}.", file_paths))
}

/// Architectural plan for the whole program.
pub fn plan(prompt: &str) -> Vec<ChatMessage> {
    vec![
        system(
            "When given their intent, create a short, coherent plan of the program: the files it needs, \
             what each file is responsible for, and the names of the shared dependencies (exported functions, \
             classes, data shapes) that files must agree on.

Do not write any code. Respond only with the plan.",
        ),
        want(prompt),
    ]
}

/// Initial dependency list.
pub fn initial_packages(
    prompt: &str,
    plan: &str,
    package_manager: PackageManager,
) -> Vec<ChatMessage> {
    vec![
        system(&format!(
            "When given their intent, create a list of packages installable via {} that the user would want \
             to install for the program.

Do not include packages part of the standard library already.

Do not add any other explanation, only return a list of strings.",
            package_manager
        )),
        want(prompt),
        agreed_plan(plan),
    ]
}

/// File paths the project will contain.
pub fn file_paths(prompt: &str, plan: &str) -> Vec<ChatMessage> {
    vec![
        system(
            "When given their intent, list the relative paths of every file that needs to be written \
             for the program, including tests.

Only list paths you will populate. Do not add any other explanation.",
        ),
        want(prompt),
        agreed_plan(plan),
    ]
}

/// Content for a single file.
pub fn generate_code(prompt: &str, plan: &str, file_path: &str) -> Vec<ChatMessage> {
    vec![
        system(
            "You will be given the user's intent and the agreed plan. Write the complete contents of the \
             one file you are asked for, consistent with the plan and the shared dependencies it names.

Only write valid code for the given filepath and file type, and return only the code. \
Do not include code fences in your response.",
        ),
        want(prompt),
        agreed_plan(plan),
        ChatMessage::user(format!(
            "Write the full code for {}. Begin generating the code now.",
            file_path
        )),
    ]
}

/// Diagnosis of a failing test run.
pub fn diagnose(
    prompt: &str,
    plan: &str,
    file_paths: &[String],
    test_command: &str,
    stdout: &str,
    stderr: &str,
) -> Vec<ChatMessage> {
    vec![
        system(
            "You will be given a user's prompt for a program they want, and the output of tests that were run on the program.

Given this information, and a list of the file paths, come up with a short diagnosis of what the issue is. \
Along with each suggested change, include the file path that the change should be made in.

You may also suggest packages that should be installed or changes to the environment that should be made.

Do not provide any general advice that does not fix these issues.",
        ),
        want(prompt),
        agreed_plan(plan),
        file_list(file_paths),
        ChatMessage::user(format!(
            "After running {}, the stdout was: {}",
            test_command, stdout
        )),
        ChatMessage::user(format!(
            "After running {}, the stderr was: {}",
            test_command, stderr
        )),
    ]
}

/// Structured repair plan.
pub fn plan_repair(
    prompt: &str,
    package_manager: PackageManager,
    file_paths: &[String],
    diagnosis: &str,
) -> Vec<ChatMessage> {
    vec![
        system(&format!(
            "You will be given a user's prompt for a program they want, the output of tests that were run on \
             the program, and a diagnosis for the issue.

Given this information, and a list of the file paths, output:

1. Any files that need to be corrected

2. Any packages that needs to be installed in the environment via {}. Do not reinstall packages that are already installed.

3. Any commands that need to be run (e.g. `apt-get install -y pkg-config`). Note that the OS is Debian-based. Do not use sudo in the command.

*DO NOT* add any other explanation.",
            package_manager
        )),
        want(prompt),
        file_list(file_paths),
        ChatMessage::user(format!("A likely diagnosis for the bug is: {}", diagnosis)),
    ]
}

/// Fixed content for one file, or `None`.
pub fn patch_file(
    prompt: &str,
    file_path: &str,
    content: &str,
    file_paths: &[String],
    diagnosis: &str,
) -> Vec<ChatMessage> {
    vec![
        system(
            "You will be given a user's prompt for a program they want, the output of tests that were run on \
             the program, and a possible diagnosis of the issue.

Given this information, and one of the files, determine if the file is the source of the bug, and if so, fix it.

If the file is the source of the bug, output the fixed code. Otherwise, output the string `None` and NOTHING ELSE.

Only write valid code for the given filepath and file type, and return only the code. \
*DO NOT* include comments explaining what the bug was, or add any other explanation.",
        ),
        want(prompt),
        ChatMessage::user(format!(
            "The full list of file paths is {:?}. The path of the current file is {}. Its contents are: {}",
            file_paths, file_path, content
        )),
        ChatMessage::user(format!("A likely diagnosis for the bug is: {}", diagnosis)),
        ChatMessage::user(
            "Every line of code you generate must be valid code. Do not include code fences in your response. \
             Begin generating the code now.",
        ),
    ]
}
