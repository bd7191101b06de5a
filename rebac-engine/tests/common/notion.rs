//! Notion-like collaboration model: workspaces holding pages, databases,
//! blocks, comments, templates and integrations.

use rebac_engine::{EntityTypeDefinition, PermissionExpression as E, Schema};

/// `relation workspace` plus `read`/`write` permissions that fall back to
/// the workspace's own `read`/`write`.
fn workspace_scoped(
    name: &str,
    reader: &str,
    writer: &str,
) -> EntityTypeDefinition {
    EntityTypeDefinition::new(name)
        .relation("workspace", &["workspace"])
        .unwrap()
        .relation(writer, &["user"])
        .unwrap()
        .relation(reader, &["user", "workspace#member", "workspace#guest"])
        .unwrap()
        .permission(
            "read",
            E::union([E::relation(reader), E::indirect("workspace", "read")]),
        )
        .permission(
            "write",
            E::union([E::relation(writer), E::indirect("workspace", "write")]),
        )
}

pub fn notion_schema() -> Schema {
    let any_of = |relations: &[&str]| E::union(relations.iter().map(|r| E::relation(*r)));

    Schema::new([
        EntityTypeDefinition::new("user"),
        EntityTypeDefinition::new("workspace")
            .relation("owner", &["user"])
            .unwrap()
            .relation("member", &["user"])
            .unwrap()
            .relation("guest", &["user"])
            .unwrap()
            .relation("bot", &["user"])
            .unwrap()
            .relation("admin", &["user"])
            .unwrap()
            .permission("create_page", any_of(&["owner", "member", "admin"]))
            .permission("invite_member", any_of(&["owner", "admin"]))
            .permission("view_workspace", any_of(&["owner", "member", "guest", "bot"]))
            .permission("manage_workspace", any_of(&["owner", "admin"]))
            .permission("read", any_of(&["member", "guest", "bot", "admin"]))
            .permission("write", any_of(&["owner", "admin"])),
        workspace_scoped("page", "reader", "writer"),
        workspace_scoped("database", "viewer", "editor")
            .permission(
                "create",
                E::union([E::relation("editor"), E::indirect("workspace", "write")]),
            )
            .permission(
                "delete",
                E::union([E::relation("editor"), E::indirect("workspace", "write")]),
            ),
        EntityTypeDefinition::new("block")
            .relation("page", &["page"])
            .unwrap()
            .relation("database", &["database"])
            .unwrap()
            .relation("editor", &["user"])
            .unwrap()
            .relation("commenter", &["user", "page#reader"])
            .unwrap()
            .permission(
                "read",
                E::union([E::indirect("database", "read"), E::relation("commenter")]),
            )
            .permission(
                "write",
                E::union([E::relation("editor"), E::indirect("database", "write")]),
            )
            .permission("comment", E::relation("commenter")),
        EntityTypeDefinition::new("comment")
            .relation("block", &["block"])
            .unwrap()
            .relation("author", &["user"])
            .unwrap()
            .permission("read", E::indirect("block", "read"))
            .permission("write", E::relation("author")),
        workspace_scoped("template", "viewer", "creator")
            .permission(
                "create",
                E::union([E::relation("creator"), E::indirect("workspace", "write")]),
            )
            .permission(
                "delete",
                E::union([E::relation("creator"), E::indirect("workspace", "write")]),
            ),
        EntityTypeDefinition::new("integration")
            .relation("workspace", &["workspace"])
            .unwrap()
            .relation("owner", &["user"])
            .unwrap()
            .permission("read", E::indirect("workspace", "read"))
            .permission(
                "write",
                E::union([E::relation("owner"), E::indirect("workspace", "write")]),
            ),
    ])
    .unwrap()
}

pub const NOTION: &[&str] = &[
    "workspace:engineering_team#owner@user:alice",
    "workspace:engineering_team#member@user:bob",
    "workspace:engineering_team#guest@user:charlie",
    "workspace:engineering_team#admin@user:alice",
    "workspace:sales_team#owner@user:david",
    "workspace:sales_team#member@user:eve",
    "workspace:sales_team#guest@user:frank",
    "workspace:sales_team#admin@user:david",
    "page:project_plan#workspace@workspace:engineering_team",
    "page:product_spec#workspace@workspace:engineering_team",
    "database:task_list#workspace@workspace:engineering_team",
    "template:weekly_report#workspace@workspace:sales_team",
    "database:customer_list#workspace@workspace:sales_team",
    "template:marketing_campaign#workspace@workspace:sales_team",
    "page:project_plan#writer@user:frank",
    "page:project_plan#reader@user:bob",
    "database:task_list#editor@user:alice",
    "database:task_list#viewer@user:bob",
    "template:weekly_report#creator@user:alice",
    "template:weekly_report#viewer@user:bob",
    "page:product_spec#writer@user:david",
    "page:product_spec#reader@user:eve",
    "database:customer_list#editor@user:david",
    "database:customer_list#viewer@user:eve",
    "template:marketing_campaign#creator@user:david",
    "template:marketing_campaign#viewer@user:eve",
    "block:task_list_1#database@database:task_list",
    "block:task_list_1#editor@user:alice",
    "block:task_list_1#commenter@user:bob",
    "block:task_list_2#database@database:task_list",
    "block:task_list_2#editor@user:alice",
    "block:task_list_2#commenter@user:bob",
    "comment:task_list_1_comment_1#block@block:task_list_1",
    "comment:task_list_1_comment_1#author@user:bob",
    "comment:task_list_1_comment_2#block@block:task_list_1",
    "comment:task_list_1_comment_2#author@user:charlie",
    "comment:task_list_2_comment_1#block@block:task_list_2",
    "comment:task_list_2_comment_1#author@user:bob",
    "comment:task_list_2_comment_2#block@block:task_list_2",
    "comment:task_list_2_comment_2#author@user:charlie",
];
