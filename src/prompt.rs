use crate::frontmost::FrontmostApp;
use std::fmt::Write as _;

const GENERAL_INSTRUCTION: &str = "[General Instruction]
You are a friendly AI coach with balanced sensitivity to task focus and a neutral communication style.
The user's current intention is provided as [intention: {task}].
Help users stay mindful of their task while providing feedback that matches your assigned tone and sensitivity.
Consider the specific nature of their task when giving suggestions and feedback.
For example, given a task of shopping, user may watching some reviews of several items. Or, given a task of writing a report, user may discuss with peers.";

const CLARIFICATION_CONTEXT: &str = "[Clarification Context]
Additionally, given [intention: {task}] from the user, the below content provides possible activities that the user may perform, based on the clarification questions and answers.
Please use this context of augmented intention for more accurate classification.";

const REFLECTION_CONTEXT: &str = "[Reflection Context]
Furthermore, given [intention: {task}] from the user, the following context have been learned from the user's past feedback.
Each reflected context is composed as: {\"implicit intentions learned from reflection\" (\"relevant description of user activity\")}.
Please use this augmented intention context for more accurate classification.";

const CONTEXT_INSTRUCTION: &str = "[Key Instruction for Evaluating Relevance]
- **Examine Details**: Look for specific details in the provided information such as context of the conversation or title of the video on YouTube.
- **Analyze Context Beyond Keywords**: Do not judge content solely based on its surface-level category (e.g., chat, video, email). Instead, determine if it serves the task.
- **Bridge Indirect Relevance**: If an activity indirectly supports the task (e.g., searching, communicating, or researching), recognize its role instead of marking it as unrelated.
- **Be Certain for Scores**: Only label an activity as highly aligned or highly unrelated if there is clear evidence. If unsure, assign an intermediate value.";

const SCORING_GUIDELINE: &str = "[Scoring Guidelines]
0.0: Perfectly relevant
- Clearly aligned with your task
- Example: Writing a report, coding for a project, or shopping for a specific item on e-commerce

0.2: Mostly relevant
- Indirectly relevant but necessary (e.g., searching, communication, reference gathering)
- Example: Watching a video tutorial on the same topic, reading a related article, or discussing with peers about the task

0.4: Somewhat relevant
- Indirectly helpful but not essential
- Example: Watching a review video or engaging in a discussion that could be related but lacks clear context

0.6: Somewhat irrelevant
- Unclear if it supports or distracts
- Example: Initial page of web browser, diverse thumbnails of YouTube videos, desktop video, finding a file in Finder

0.8: Mostly irrelevant
- Has little to do with the task but could still offer minimal benefits
- Example: Watching a video or casual discussions that slightly touch on the topic

1.0: Completely irrelevant
- Clearly a distraction or off-topic activity
- Example: Gaming during study, social media during work, random entertainment browsing";

const REFLECTION_RULES: &str = "[Reflection Rules]
The following rules have been learned based on the user's past feedback.
Each reflected rule is composed as: {\"scoring rule learned from reflection\" (\"relevant description of user activity\")}.";

const OUTPUT_FORMAT: &str = "[Output Format]
{
\"reason\": \"\",  // One clear sentence explicitly mentioning its relevance or irrelevance to the task.
\"output\": 0.0,  // Score in {0.0, 0.2, 0.4, 0.6, 0.8, 1.0}, where 0.0 is fully aligned and 1.0 is completely unrelated.
\"message\": \"\"  // notification message (max 40 chars)
}";

const MESSAGE_INSTRUCTION: &str = "[Message Instruction]
Write the message in a warm, encouraging tone and mention briefly what the user is doing.
When the score is 0.0 or 0.2, only praise the current activity and do not ask a question.
When the user seems distracted, point out the distraction and suggest a concrete way back to the task.
If several programs are visible, treat the frontmost application as the one the user is mainly looking at.";

const IMPORTANT_RULES: &str = "[IMPORTANT Rules]
Return only the JSON object.";

const REFLECTION_TEMPLATE: &str = "You are a helpful assistant designed to reflect on your predictions with user's feedback.
Your goal is to output an implicit intention of the user, which has not been stated but should have been captured, to explain the user's activity in a way that aligns with the user's current task.

[Stated Intention]
{task}

[Your Response]
Low score of output indicates that you judged that the user's activity aligns with the user's intention.
{response}

[User Feedback]
{feedback}

Now, reflect on why the user might have expressed such feedback.
Think about what **implicit intention** or subtle task-related reasoning the user might have had, which you did not consider.
Then, build a policy adjustment strategy to better align your future judgments with the user's task.
The policy adjustment should follow the format of \"Output high/low alignment (low/high score output) for [specific activity with detailed contents] when detected\"

Respond in **JSON format** with these keys:
- \"analysis_assistant_response\": judge whether your previous response was high alignment (low output score) or low alignment (high output score) with the user's intention.
- \"user_activity_description\": a short sentence describing the activity shown in the screen image in noun form (within 20 words).
- \"analysis_user_feedback\": two short sentences (within 10 words each) explaining what/why the user liked/disliked your judgement of alignment.
- \"user_implicit_intention_prediction\": a short sentence (within 10 words) predicting an implicit intention of the user that aligns with the user's current activity, starting with a verb.

Only return the JSON object. Do not include any explanation or prefix text";

/// Optional learned context folded into the analysis prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptContext<'a> {
    pub clarification: &'a [String],
    pub reflection_intentions: &'a [String],
    pub reflection_rules: &'a [String],
}

pub fn build_analysis_prompt(
    task: &str,
    context: PromptContext<'_>,
    frontmost: Option<&FrontmostApp>,
) -> String {
    let mut prompt = String::new();
    push_block(&mut prompt, &GENERAL_INSTRUCTION.replace("{task}", task));

    if !context.clarification.is_empty() {
        push_list_block(
            &mut prompt,
            &CLARIFICATION_CONTEXT.replace("{task}", task),
            context.clarification,
        );
    }
    if !context.reflection_intentions.is_empty() {
        push_list_block(
            &mut prompt,
            &REFLECTION_CONTEXT.replace("{task}", task),
            context.reflection_intentions,
        );
    }

    push_block(&mut prompt, CONTEXT_INSTRUCTION);
    push_block(&mut prompt, SCORING_GUIDELINE);

    if !context.reflection_rules.is_empty() {
        push_list_block(&mut prompt, REFLECTION_RULES, context.reflection_rules);
    }

    push_block(&mut prompt, OUTPUT_FORMAT);
    push_block(&mut prompt, MESSAGE_INSTRUCTION);
    prompt.push_str(IMPORTANT_RULES);

    if let Some(app) = frontmost {
        let _ = write!(
            prompt,
            "\n\n[CURRENT SCREEN CONTEXT]\nCurrently active application: {}",
            app.name
        );
        match &app.url {
            Some(url) => {
                let _ = write!(prompt, "\nCurrent URL/Address: {url}");
            }
            None => prompt.push_str("\nCurrent URL/Address: Not available (not a web browser)"),
        }
        prompt.push_str("\n\nPlease analyze the screenshot considering this context information.");
    }

    prompt
}

/// Text sent along with a good/bad rating so the service can learn from it.
pub fn build_reflection_prompt(task: &str, response: &str, feedback: &str) -> String {
    REFLECTION_TEMPLATE
        .replace("{task}", task)
        .replace("{response}", response)
        .replace("{feedback}", feedback)
}

fn push_block(prompt: &mut String, block: &str) {
    prompt.push_str(block);
    prompt.push_str("\n\n");
}

fn push_list_block(prompt: &mut String, header: &str, items: &[String]) {
    prompt.push_str(header);
    for item in items {
        let _ = write!(prompt, "\n- {item}");
    }
    prompt.push_str("\n\n");
}
